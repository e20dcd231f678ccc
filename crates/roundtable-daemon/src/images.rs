//! Backend image format policy.
//!
//! Backends disagree on accepted formats: backend-A prefers WebP and also
//! takes PNG/JPEG/GIF; backend-B takes PNG only. Media types are
//! normalized and unsupported images dropped with a warning before a
//! message is handed to a client.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

use crate::domain::{BackendKind, InlineImage};
use crate::providers::ContentBlock;

/// Accepted media types per backend, preferred format first.
fn accepted_media_types(backend: BackendKind) -> &'static [&'static str] {
    match backend {
        BackendKind::Alpha => &["image/webp", "image/png", "image/jpeg", "image/gif"],
        BackendKind::Beta => &["image/png"],
    }
}

/// Normalize a media type to its canonical form.
fn normalize_media_type(media_type: &str) -> String {
    let lowered = media_type.trim().to_lowercase();
    match lowered.as_str() {
        "image/jpg" => "image/jpeg".to_string(),
        other => other.to_string(),
    }
}

/// Filter a block list down to what the backend accepts, normalizing
/// media types in place. Text blocks pass through untouched.
pub fn prepare_blocks_for(backend: BackendKind, blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { .. } => Some(block),
            ContentBlock::Image { source } => {
                let media_type = normalize_media_type(&source.media_type);
                if !accepted_media_types(backend).contains(&media_type.as_str()) {
                    warn!(
                        backend = %backend,
                        media_type = %source.media_type,
                        "Dropping image with unsupported format"
                    );
                    return None;
                }
                if BASE64.decode(&source.data).is_err() {
                    warn!(backend = %backend, "Dropping image with invalid base64 payload");
                    return None;
                }
                Some(ContentBlock::Image {
                    source: InlineImage { data: source.data, media_type },
                })
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn image(media_type: &str) -> ContentBlock {
        ContentBlock::Image {
            source: InlineImage {
                data: "aGk=".to_string(),
                media_type: media_type.to_string(),
            },
        }
    }

    #[test]
    fn beta_accepts_png_only() {
        let blocks = vec![image("image/png"), image("image/webp"), image("image/jpeg")];
        let prepared = prepare_blocks_for(BackendKind::Beta, blocks);
        assert_eq!(prepared.len(), 1);
    }

    #[test]
    fn alpha_accepts_webp() {
        let prepared = prepare_blocks_for(BackendKind::Alpha, vec![image("image/webp")]);
        assert_eq!(prepared.len(), 1);
    }

    #[test]
    fn jpg_normalizes_to_jpeg() {
        let prepared = prepare_blocks_for(BackendKind::Alpha, vec![image("image/JPG")]);
        let [ContentBlock::Image { source }] = prepared.as_slice() else {
            panic!("expected one image");
        };
        assert_eq!(source.media_type, "image/jpeg");
    }

    #[test]
    fn invalid_base64_is_dropped() {
        let blocks = vec![ContentBlock::Image {
            source: InlineImage {
                data: "not base64 at all!!!".to_string(),
                media_type: "image/png".to_string(),
            },
        }];
        assert!(prepare_blocks_for(BackendKind::Beta, blocks).is_empty());
    }

    #[test]
    fn text_blocks_pass_through() {
        let blocks = vec![
            ContentBlock::Text { text: "hi".to_string() },
            image("image/tiff"),
        ];
        let prepared = prepare_blocks_for(BackendKind::Beta, blocks);
        assert_eq!(prepared.len(), 1);
        assert!(matches!(&prepared[0], ContentBlock::Text { .. }));
    }
}
