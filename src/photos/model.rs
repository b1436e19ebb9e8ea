use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(MediaType::Photo),
            "video" => Some(MediaType::Video),
            _ => None,
        }
    }
}

/// Confidence attached to a remote auto-select suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiConfidence {
    High,
    Medium,
    Low,
}

impl AiConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiConfidence::High => "high",
            AiConfidence::Medium => "medium",
            AiConfidence::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(AiConfidence::High),
            "medium" => Some(AiConfidence::Medium),
            "low" => Some(AiConfidence::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Reviewed,
    Deleted,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Reviewed => "reviewed",
            ReviewStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReviewStatus::Pending),
            "reviewed" => Some(ReviewStatus::Reviewed),
            "deleted" => Some(ReviewStatus::Deleted),
            _ => None,
        }
    }
}

/// One photo as mirrored from the remote gallery.
///
/// `id` is the gallery's own opaque identifier. `timestamp` (epoch millis
/// derived from `date_taken`) is authoritative for all ordering; the raw
/// `date_taken` string is kept for display only.
#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub id: String,
    pub blob: Vec<u8>,
    pub media_type: MediaType,
    pub date_taken: String,
    pub timestamp: i64,
    pub has_embedding: bool,
    pub group_id: Option<String>,
    pub ai_reason: Option<String>,
    pub ai_confidence: Option<AiConfidence>,
}

/// Persisted feature vector for one photo. 768 floats, unit L2 norm.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub photo_id: String,
    pub vector: Vec<f32>,
    pub created_at: i64,
}

/// One duplicate cluster with at least two members.
///
/// `photo_ids` is ordered by member timestamp ascending; every listed photo
/// carries this group's id in its `group_id` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoGroup {
    pub id: String,
    pub photo_ids: Vec<String>,
    pub similarity_score: f32,
    pub created_at: i64,
    pub review_status: ReviewStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionEntry {
    pub photo_id: String,
    pub selected_at: i64,
}

/// Pagination direction over a kind's primary ordering index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    Ascending,
    Descending,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("similarity threshold must be in (0, 1], got {0}")]
    ThresholdOutOfRange(f32),
    #[error("minimum group size must be at least 2, got {0}")]
    GroupSizeTooSmall(usize),
}

/// User-facing grouping knobs.
///
/// The threshold has no default on purpose: the upstream products disagreed
/// on a value, so callers must pick one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupingSettings {
    pub similarity_threshold: f32,
    pub time_window_minutes: u32,
    pub min_group_size: usize,
}

impl GroupingSettings {
    pub fn new(
        similarity_threshold: f32,
        time_window_minutes: u32,
        min_group_size: usize,
    ) -> Result<Self, SettingsError> {
        if !(similarity_threshold > 0.0 && similarity_threshold <= 1.0) {
            return Err(SettingsError::ThresholdOutOfRange(similarity_threshold));
        }
        if min_group_size < 2 {
            return Err(SettingsError::GroupSizeTooSmall(min_group_size));
        }
        Ok(Self {
            similarity_threshold,
            time_window_minutes,
            min_group_size,
        })
    }

    /// Time window in epoch milliseconds, the unit `Photo.timestamp` uses.
    pub fn time_window_millis(&self) -> i64 {
        i64::from(self.time_window_minutes) * 60_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trips() {
        for status in [
            ReviewStatus::Pending,
            ReviewStatus::Reviewed,
            ReviewStatus::Deleted,
        ] {
            assert_eq!(ReviewStatus::parse(status.as_str()), Some(status));
        }
        for mt in [MediaType::Photo, MediaType::Video] {
            assert_eq!(MediaType::parse(mt.as_str()), Some(mt));
        }
        for c in [AiConfidence::High, AiConfidence::Medium, AiConfidence::Low] {
            assert_eq!(AiConfidence::parse(c.as_str()), Some(c));
        }
        assert_eq!(ReviewStatus::parse("bogus"), None);
    }

    #[test]
    fn test_settings_require_valid_threshold() {
        assert!(GroupingSettings::new(0.0, 60, 2).is_err());
        assert!(GroupingSettings::new(1.01, 60, 2).is_err());
        assert!(GroupingSettings::new(f32::NAN, 60, 2).is_err());
        assert!(GroupingSettings::new(0.9, 60, 1).is_err());
        let s = GroupingSettings::new(0.9, 60, 2).unwrap();
        assert_eq!(s.time_window_millis(), 3_600_000);
    }

    #[test]
    fn test_settings_window_zero() {
        let s = GroupingSettings::new(1.0, 0, 2).unwrap();
        assert_eq!(s.time_window_millis(), 0);
    }
}
