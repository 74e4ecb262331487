//! Similarity clustering over precomputed neighbour lists.
//!
//! Pure and synchronous: given the records of one feature set and their
//! neighbour lists, produce non-overlapping clusters ranked by size and
//! assigned to pages. Identical inputs always yield identical output.

pub mod neighbors;

use serde::Serialize;
use thiserror::Error;

use crate::services::features::FeatureRecord;
use neighbors::NeighborList;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    /// Maximum neighbour distance (exclusive) for membership.
    pub threshold: f32,
    pub min_cluster_size: usize,
    /// Items (excluding main items) per page.
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterParamsError {
    #[error("similarity threshold must be a finite number")]
    NonFiniteThreshold,
    #[error("minimum cluster size must be at least 1")]
    MinClusterSize,
    #[error("page size must be at least 1")]
    PageSize,
}

impl ClusterParams {
    pub fn validate(&self) -> Result<(), ClusterParamsError> {
        if !self.threshold.is_finite() {
            return Err(ClusterParamsError::NonFiniteThreshold);
        }
        if self.min_cluster_size == 0 {
            return Err(ClusterParamsError::MinClusterSize);
        }
        if self.page_size == 0 {
            return Err(ClusterParamsError::PageSize);
        }
        Ok(())
    }
}

/// Item reference as presented to the panel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterItem {
    pub item_id: String,
    pub name: String,
    pub thumbnail: String,
    pub annotated: bool,
}

impl From<&FeatureRecord> for ClusterItem {
    fn from(record: &FeatureRecord) -> Self {
        Self {
            item_id: record.item_id.clone(),
            name: record.name.clone(),
            thumbnail: record.thumbnail.clone(),
            annotated: record.annotated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub key: String,
    pub main_item: ClusterItem,
    pub items: Vec<ClusterItem>,
    pub is_chosen: bool,
    pub page: usize,
}

impl Cluster {
    /// Well-formed stand-in returned when nothing clusters.
    pub fn placeholder() -> Self {
        Self {
            key: cluster_key(0),
            main_item: ClusterItem::default(),
            items: Vec::new(),
            is_chosen: true,
            page: 1,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.main_item.item_id.is_empty() && self.items.is_empty()
    }
}

fn cluster_key(n: usize) -> String {
    format!("Cluster {n}")
}

/// Group `records` into ranked, paginated clusters.
///
/// `neighbors[i]` holds the neighbour list of `records[i]`; missing lists and
/// out-of-range indices are ignored. Never returns an empty list.
pub fn cluster(
    records: &[FeatureRecord],
    neighbors: &[NeighborList],
    params: &ClusterParams,
) -> Result<Vec<Cluster>, ClusterParamsError> {
    params.validate()?;
    debug_assert!(params.page_size > 0);

    let groups: Vec<&[usize]> = (0..records.len())
        .map(|i| neighbors.get(i).map_or(&[][..], |list| list.within(params.threshold)))
        .collect();

    // Stable: equal sizes keep item order.
    let mut order: Vec<usize> = (0..groups.len()).collect();
    order.sort_by(|a, b| groups[*b].len().cmp(&groups[*a].len()));

    let mut used = vec![false; records.len()];
    let mut in_group = vec![false; records.len()];
    let mut clusters = Vec::new();

    for group_idx in order {
        let mut unique = Vec::with_capacity(groups[group_idx].len());
        for &member in groups[group_idx] {
            if member < records.len() && !used[member] && !in_group[member] {
                in_group[member] = true;
                unique.push(member);
            }
        }
        for &member in &unique {
            in_group[member] = false;
        }
        if unique.is_empty() || unique.len() < params.min_cluster_size {
            continue;
        }

        for &member in &unique {
            debug_assert!(!used[member], "item {member} placed in two clusters");
            used[member] = true;
        }
        let key = cluster_key(clusters.len());
        let main_item = ClusterItem::from(&records[unique[0]]);
        let items = unique[1..]
            .iter()
            .map(|&member| ClusterItem::from(&records[member]))
            .collect();
        clusters.push(Cluster {
            key,
            main_item,
            items,
            is_chosen: false,
            page: 1,
        });
    }

    clusters.sort_by(|a, b| b.items.len().cmp(&a.items.len()));

    let mut accumulated = 0usize;
    for cluster in &mut clusters {
        cluster.page = accumulated / params.page_size + 1;
        accumulated += cluster.items.len();
    }

    match clusters.first_mut() {
        Some(first) => first.is_chosen = true,
        None => clusters.push(Cluster::placeholder()),
    }
    debug_assert!(!clusters.is_empty());
    Ok(clusters)
}
