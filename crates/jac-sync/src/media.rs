use std::collections::HashSet;

use jac_core::{RawRecord, SourcedDocument};

pub const MAX_PHOTOS: usize = 30;

/// Dedup key for a photo URL: lower-cased, query string dropped.
pub fn photo_dedup_key(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    without_query.to_lowercase()
}

/// Richer galleries contribute first; the first full URL seen per dedup key is kept.
pub fn merge_photos(group: &[RawRecord]) -> Vec<String> {
    let mut by_gallery_size = group.iter().collect::<Vec<_>>();
    by_gallery_size.sort_by(|a, b| b.photos.len().cmp(&a.photos.len()));

    let mut seen = HashSet::new();
    let mut photos = Vec::new();
    for record in by_gallery_size {
        for photo in &record.photos {
            if photo.trim().is_empty() {
                continue;
            }
            if seen.insert(photo_dedup_key(photo)) {
                photos.push(photo.clone());
            }
        }
    }
    photos.truncate(MAX_PHOTOS);
    photos
}

/// Documents dedup on exact URL, tagged with the first source that listed them.
pub fn merge_documents(group: &[RawRecord]) -> Vec<SourcedDocument> {
    let mut seen = HashSet::new();
    let mut documents = Vec::new();
    for record in group {
        for document in &record.documents {
            if document.url.is_empty() || !seen.insert(document.url.clone()) {
                continue;
            }
            documents.push(SourcedDocument {
                document: document.clone(),
                source: record.source.clone(),
            });
        }
    }
    documents
}

#[cfg(test)]
mod tests {
    use super::*;
    use jac_core::Document;

    fn with_photos(source: &str, photos: &[&str]) -> RawRecord {
        RawRecord {
            source: source.to_string(),
            photos: photos.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn query_string_variants_collapse_to_larger_gallery_copy() {
        let group = vec![
            with_photos("licitor", &["https://cdn.example/p/1.jpg?w=200"]),
            with_photos(
                "encheres_publiques",
                &[
                    "https://cdn.example/p/1.jpg?w=1600",
                    "https://cdn.example/p/2.jpg",
                ],
            ),
        ];
        let photos = merge_photos(&group);
        assert_eq!(
            photos,
            vec![
                "https://cdn.example/p/1.jpg?w=1600".to_string(),
                "https://cdn.example/p/2.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn photo_list_is_capped() {
        let many = (0..45)
            .map(|i| format!("https://cdn.example/p/{i}.jpg"))
            .collect::<Vec<_>>();
        let record = RawRecord {
            photos: many,
            ..Default::default()
        };
        assert_eq!(merge_photos(&[record]).len(), MAX_PHOTOS);
    }

    #[test]
    fn documents_keep_first_source_tag() {
        let doc = Document {
            url: "https://docs.example/ccv-17.pdf".into(),
            label: Some("Cahier des conditions de vente".into()),
            kind: Some("ccv".into()),
        };
        let mut upper = doc.clone();
        upper.url = "https://docs.example/CCV-17.pdf".into();
        let group = vec![
            RawRecord {
                source: "vench".into(),
                documents: vec![doc.clone()],
                ..Default::default()
            },
            RawRecord {
                source: "licitor".into(),
                documents: vec![doc, upper],
                ..Default::default()
            },
        ];
        let merged = merge_documents(&group);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].source, "vench");
        assert_eq!(merged[1].source, "licitor");
    }
}
