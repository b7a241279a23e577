use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Ограничение на распакованный размер для защиты от zip-bomb
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024; // 256 KiB

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("gzip error: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("invalid payload json: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON -> gzip -> base64
pub fn enc<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(value)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;

    Ok(general_purpose::STANDARD.encode(compressed))
}

/// base64 -> gunzip (с лимитом) -> JSON
pub fn dec<T: DeserializeOwned>(s: &str) -> Result<T, CodecError> {
    let compressed = general_purpose::STANDARD.decode(s)?;

    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    let mut limited_reader = gz.take(MAX_DECOMPRESSED_SIZE);
    limited_reader.read_to_end(&mut json)?;

    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::{ConnectionBundle, DescriptionKind, DescriptionPayload};

    fn sample_bundle() -> ConnectionBundle {
        ConnectionBundle {
            description: DescriptionPayload {
                kind: DescriptionKind::Offer,
                sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".into(),
                id: "aabbccdd00112233".into(),
                ts: 1_700_000_000,
            },
            candidates: Vec::new(),
        }
    }

    #[test]
    fn bundle_survives_codec() {
        let bundle = sample_bundle();
        let encoded = enc(&bundle).unwrap();
        let decoded: ConnectionBundle = dec(&encoded).unwrap();
        assert_eq!(decoded.description.id, bundle.description.id);
        assert_eq!(decoded.description.sdp, bundle.description.sdp);
    }

    #[test]
    fn garbage_is_rejected_not_panicked() {
        assert!(dec::<ConnectionBundle>("not base64 at all!!!").is_err());
        // валидный base64, но не gzip
        let b64 = base64::engine::general_purpose::STANDARD.encode(b"plain bytes");
        assert!(dec::<ConnectionBundle>(&b64).is_err());
    }
}
