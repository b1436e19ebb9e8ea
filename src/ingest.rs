use crate::photos::model::{MediaType, Photo};
use crate::photos::store::{PhotoStore, StoreError};
use serde::{Deserialize, Serialize};

/// One photo record as shipped across the isolated-context boundary by the
/// gallery scraper. The scraping context cannot share blobs directly, so
/// image bytes arrive as a plain byte sequence and are reconstituted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingPhoto {
    pub id: String,
    pub bytes: Vec<u8>,
    pub media_type: MediaType,
    pub date_taken: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: usize,
    pub net_new: usize,
}

/// Ingest one scraper batch into the store.
///
/// Records become `Photo`s with no embedding and no group. Re-delivered
/// ids silently overwrite the scraper-owned columns; anything the
/// pipelines wrote (flags, group references, AI fields) survives.
pub fn ingest_batch(
    store: &PhotoStore,
    batch: Vec<IncomingPhoto>,
) -> Result<IngestStats, StoreError> {
    let received = batch.len();
    let photos: Vec<Photo> = batch
        .into_iter()
        .map(|incoming| Photo {
            id: incoming.id,
            blob: incoming.bytes,
            media_type: incoming.media_type,
            date_taken: incoming.date_taken,
            timestamp: incoming.timestamp,
            has_embedding: false,
            group_id: None,
            ai_reason: None,
            ai_confidence: None,
        })
        .collect();
    let net_new = store.put_photos(&photos)?;
    tracing::debug!("ingest: {} received, {} net new", received, net_new);
    Ok(IngestStats { received, net_new })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(id: &str, timestamp: i64) -> IncomingPhoto {
        IncomingPhoto {
            id: id.to_string(),
            bytes: vec![0xFF, 0xD8, 0xFF, 0xE0],
            media_type: MediaType::Photo,
            date_taken: "2024-06-01T09:30:00Z".to_string(),
            timestamp,
        }
    }

    #[test]
    fn test_ingest_reconstitutes_photos() {
        let store = PhotoStore::open_in_memory().unwrap();
        let stats = ingest_batch(&store, vec![incoming("a", 1000), incoming("b", 2000)]).unwrap();

        assert_eq!(stats, IngestStats { received: 2, net_new: 2 });
        assert_eq!(store.count_photos().unwrap(), 2);

        let photo = store.get_photo("a").unwrap().unwrap();
        assert_eq!(photo.blob, vec![0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(photo.media_type, MediaType::Photo);
        assert!(!photo.has_embedding);
        assert_eq!(photo.group_id, None);
    }

    #[test]
    fn test_duplicate_ids_overwrite_silently() {
        let store = PhotoStore::open_in_memory().unwrap();
        ingest_batch(&store, vec![incoming("a", 1000)]).unwrap();
        store.put_embedding("a", &[1.0, 0.0]).unwrap();

        let mut resent = incoming("a", 1000);
        resent.bytes = vec![9, 9, 9];
        let stats = ingest_batch(&store, vec![resent]).unwrap();

        assert_eq!(stats, IngestStats { received: 1, net_new: 0 });
        assert_eq!(store.count_photos().unwrap(), 1);
        let photo = store.get_photo("a").unwrap().unwrap();
        assert_eq!(photo.blob, vec![9, 9, 9]);
        assert!(photo.has_embedding, "pipeline state survives re-delivery");
    }

    #[test]
    fn test_message_round_trips_through_json() {
        let original = incoming("a", 123);
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: IncomingPhoto = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, "a");
        assert_eq!(decoded.bytes, original.bytes);
        assert_eq!(decoded.timestamp, 123);
    }
}
