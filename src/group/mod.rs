pub mod lsh;


use crate::embed::dot;
use crate::photos::model::{GroupingSettings, PhotoGroup, ReviewStatus};
use crate::photos::store::{PhotoStore, StoreError};
use crate::util::RunGuard;
use lsh::{DimensionMismatch, LshConfig, LshIndex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_BATCH_SIZE: usize = 200;
const PERSIST_CHUNK: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum GroupingError {
    #[error("grouping is already running")]
    Busy,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("index rejected a vector: {0}")]
    Index(#[from] DimensionMismatch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingPhase {
    BuildIndex,
    FindDuplicates,
    Materialize,
    Persist,
}

#[derive(Debug, Clone)]
pub struct GroupingProgress {
    pub phase: GroupingPhase,
    pub current: usize,
    pub total: usize,
    pub groups_found: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingSummary {
    pub photos_considered: usize,
    pub groups_created: usize,
}

/// Four-phase streaming duplicate clusterer.
///
/// 1. Build the LSH index over every stored embedding.
/// 2. Walk embedded photos oldest-first, pull bucket candidates, verify
///    with a cosine check under the time window, and union matches.
/// 3. Materialise clusters of at least `min_group_size` into groups.
/// 4. Clear the previous grouping and persist the new one.
///
/// Nothing beyond the index, the union-find maps, and one batch of records
/// is ever resident. Pairwise comparison of all photos is exactly what the
/// index exists to avoid.
pub struct Grouper {
    store: Arc<PhotoStore>,
    settings: GroupingSettings,
    lsh_config: LshConfig,
    batch_size: usize,
    running: AtomicBool,
}

impl Grouper {
    pub fn new(store: Arc<PhotoStore>, settings: GroupingSettings, lsh_config: LshConfig) -> Self {
        Self {
            store,
            settings,
            lsh_config,
            batch_size: DEFAULT_BATCH_SIZE,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn run<F>(&self, mut progress: F) -> Result<GroupingSummary, GroupingError>
    where
        F: FnMut(&GroupingProgress),
    {
        let _guard = RunGuard::acquire(&self.running).ok_or(GroupingError::Busy)?;

        let total = self.store.count_embeddings()? as usize;
        if total == 0 {
            tracing::info!("grouper: no embeddings, nothing to do");
            return Ok(GroupingSummary {
                photos_considered: 0,
                groups_created: 0,
            });
        }

        let index = self.build_index(total, &mut progress)?;
        let clusters = self.find_duplicates(&index, total, &mut progress)?;
        let (groups, photo_to_group) = self.materialise(clusters, &mut progress)?;
        self.persist(&groups, &photo_to_group, &mut progress)?;

        tracing::info!(
            "grouper: complete, {} groups over {} embedded photos",
            groups.len(),
            total
        );
        Ok(GroupingSummary {
            photos_considered: total,
            groups_created: groups.len(),
        })
    }

    /// Phase 1: stream every embedding into a fresh index.
    fn build_index<F>(&self, total: usize, progress: &mut F) -> Result<LshIndex, GroupingError>
    where
        F: FnMut(&GroupingProgress),
    {
        let mut index = LshIndex::new(self.lsh_config);
        let mut current = 0usize;
        self.store
            .for_each_embedding_batch::<GroupingError, _>(self.batch_size, |batch| {
                for embedding in batch {
                    index.insert(&embedding.photo_id, &embedding.vector)?;
                }
                current += batch.len();
                progress(&GroupingProgress {
                    phase: GroupingPhase::BuildIndex,
                    current,
                    total,
                    groups_found: 0,
                    message: format!("Indexed {current} of {total} embeddings"),
                });
                Ok(())
            })?;
        let stats = index.stats();
        tracing::debug!(
            "grouper: index built, {} photos across {} tables",
            stats.num_photos,
            stats.tables.len()
        );
        Ok(index)
    }

    /// Phase 2: candidate lookup plus cosine verification under the time
    /// window, merging matches with a union-find.
    fn find_duplicates<F>(
        &self,
        index: &LshIndex,
        total: usize,
        progress: &mut F,
    ) -> Result<HashMap<u64, Vec<String>>, GroupingError>
    where
        F: FnMut(&GroupingProgress),
    {
        let threshold = self.settings.similarity_threshold;
        let window_millis = self.settings.time_window_millis();

        let mut merger = ClusterMerger::default();
        let mut current = 0usize;

        self.store
            .for_each_embedded_batch::<GroupingError, _>(self.batch_size, |batch| {
                for photo in batch {
                    current += 1;
                    // A photo that already joined a cluster was compared
                    // when it was a candidate; it cannot seed new matches
                    // beyond what the merge logic covers.
                    if merger.cluster_of(&photo.id).is_some() {
                        self.emit_find_progress(progress, current, total, merger.len());
                        continue;
                    }
                    let Some(embedding) = self.store.get_embedding(&photo.id)? else {
                        tracing::warn!("grouper: photo {} flagged but has no embedding", photo.id);
                        continue;
                    };
                    let mut candidates: Vec<String> = index
                        .candidates(&embedding.vector, &photo.id)?
                        .into_iter()
                        .collect();
                    candidates.sort();

                    for candidate_id in candidates {
                        // Same cluster already: the dot product is settled.
                        if merger.same_cluster(&photo.id, &candidate_id) {
                            continue;
                        }
                        let Some(candidate) = self.store.get_photo(&candidate_id)? else {
                            continue;
                        };
                        if (photo.timestamp - candidate.timestamp).abs() > window_millis {
                            continue;
                        }
                        let Some(candidate_embedding) = self.store.get_embedding(&candidate_id)?
                        else {
                            continue;
                        };
                        let cosine = dot(&embedding.vector, &candidate_embedding.vector);
                        if cosine >= threshold {
                            merger.union(&photo.id, &candidate_id);
                        }
                    }
                    self.emit_find_progress(progress, current, total, merger.len());
                }
                Ok(())
            })?;

        Ok(merger.into_clusters())
    }

    fn emit_find_progress<F>(&self, progress: &mut F, current: usize, total: usize, found: usize)
    where
        F: FnMut(&GroupingProgress),
    {
        progress(&GroupingProgress {
            phase: GroupingPhase::FindDuplicates,
            current,
            total,
            groups_found: found,
            message: format!("Compared {current} of {total} photos"),
        });
    }

    /// Phase 3: turn clusters into persistable groups, members ordered by
    /// timestamp. Undersized clusters are dropped.
    fn materialise<F>(
        &self,
        clusters: HashMap<u64, Vec<String>>,
        progress: &mut F,
    ) -> Result<(Vec<PhotoGroup>, HashMap<String, String>), GroupingError>
    where
        F: FnMut(&GroupingProgress),
    {
        let mut cluster_ids: Vec<u64> = clusters.keys().copied().collect();
        cluster_ids.sort_unstable();

        let total = cluster_ids.len();
        let mut groups = Vec::new();
        let mut photo_to_group: HashMap<String, String> = HashMap::new();

        for (done, cluster_id) in cluster_ids.into_iter().enumerate() {
            let member_ids = &clusters[&cluster_id];
            if member_ids.len() >= self.settings.min_group_size {
                let mut members = self.store.get_photos_by_ids(member_ids)?;
                members.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
                let group = PhotoGroup {
                    id: uuid::Uuid::new_v4().to_string(),
                    photo_ids: members.iter().map(|p| p.id.clone()).collect(),
                    // The configured threshold stands in for the cluster's
                    // actual pairwise similarity.
                    similarity_score: self.settings.similarity_threshold,
                    created_at: chrono::Utc::now().timestamp_millis(),
                    review_status: ReviewStatus::Pending,
                };
                for member in &group.photo_ids {
                    photo_to_group.insert(member.clone(), group.id.clone());
                }
                groups.push(group);
            }
            progress(&GroupingProgress {
                phase: GroupingPhase::Materialize,
                current: done + 1,
                total,
                groups_found: groups.len(),
                message: format!("Materialised {} groups", groups.len()),
            });
        }
        Ok((groups, photo_to_group))
    }

    /// Phase 4: drop the previous grouping, write the new groups in chunks,
    /// then back-fill `group_id` over a photo stream. A crash mid-persist
    /// leaves nulled photos plus a partial groups table, which the next
    /// successful run clears and overwrites.
    fn persist<F>(
        &self,
        groups: &[PhotoGroup],
        photo_to_group: &HashMap<String, String>,
        progress: &mut F,
    ) -> Result<(), GroupingError>
    where
        F: FnMut(&GroupingProgress),
    {
        self.store.clear_groups()?;

        let total = groups.len();
        let mut written = 0usize;
        for chunk in groups.chunks(PERSIST_CHUNK) {
            self.store.put_groups(chunk)?;
            written += chunk.len();
            progress(&GroupingProgress {
                phase: GroupingPhase::Persist,
                current: written,
                total,
                groups_found: total,
                message: format!("Saved {written} of {total} groups"),
            });
        }

        self.store
            .for_each_photo_batch::<GroupingError, _>(self.batch_size, |batch| {
                let assignments: Vec<(String, Option<String>)> = batch
                    .iter()
                    .filter_map(|photo| {
                        photo_to_group
                            .get(&photo.id)
                            .map(|group_id| (photo.id.clone(), Some(group_id.clone())))
                    })
                    .collect();
                if !assignments.is_empty() {
                    self.store.assign_group_ids(&assignments)?;
                }
                Ok(())
            })?;
        Ok(())
    }
}

/// Union-find over photo ids with explicit member lists, merging the
/// smaller cluster into the larger. Keeping both maps makes the transitive
/// closure cheap: when two established clusters touch, every moved id is
/// rewritten once.
#[derive(Default)]
struct ClusterMerger {
    photo_to_cluster: HashMap<String, u64>,
    clusters: HashMap<u64, Vec<String>>,
    next_cluster: u64,
}

impl ClusterMerger {
    fn cluster_of(&self, photo_id: &str) -> Option<u64> {
        self.photo_to_cluster.get(photo_id).copied()
    }

    fn same_cluster(&self, a: &str, b: &str) -> bool {
        match (self.cluster_of(a), self.cluster_of(b)) {
            (Some(ca), Some(cb)) => ca == cb,
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.clusters.len()
    }

    fn union(&mut self, a: &str, b: &str) {
        match (self.cluster_of(a), self.cluster_of(b)) {
            (None, None) => {
                let id = self.next_cluster;
                self.next_cluster += 1;
                self.clusters.insert(id, vec![a.to_string(), b.to_string()]);
                self.photo_to_cluster.insert(a.to_string(), id);
                self.photo_to_cluster.insert(b.to_string(), id);
            }
            (Some(existing), None) => self.join(existing, b),
            (None, Some(existing)) => self.join(existing, a),
            (Some(ca), Some(cb)) if ca != cb => self.merge(ca, cb),
            _ => {}
        }
    }

    fn join(&mut self, cluster: u64, photo_id: &str) {
        self.clusters
            .entry(cluster)
            .or_default()
            .push(photo_id.to_string());
        self.photo_to_cluster.insert(photo_id.to_string(), cluster);
    }

    fn merge(&mut self, a: u64, b: u64) {
        let (keep, absorb) = {
            let len_a = self.clusters.get(&a).map_or(0, Vec::len);
            let len_b = self.clusters.get(&b).map_or(0, Vec::len);
            if len_a >= len_b {
                (a, b)
            } else {
                (b, a)
            }
        };
        let moved = self.clusters.remove(&absorb).unwrap_or_default();
        for photo_id in &moved {
            self.photo_to_cluster.insert(photo_id.clone(), keep);
        }
        self.clusters.entry(keep).or_default().extend(moved);
    }

    fn into_clusters(self) -> HashMap<u64, Vec<String>> {
        self.clusters
    }
}
