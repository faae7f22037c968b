//! Trackable database persistence.
//!
//! The on-disk format is a single JSON object keyed exactly like the
//! original tool chain expects: `totalTrackables`, `featureType`, then
//! `trackableId{i}`, `trackableFileName{i}`, `trackableScale{i}`,
//! `trackableImage{i}`, `trackableWidth{i}`, `trackableHeight{i}`,
//! `trackableDescriptors{i}`, `trackableFeaturePoints{i}`,
//! `trackableCornerPoints{i}` per stored trackable. Only base-level data
//! is stored; higher pyramid levels, their corners, and the selectors
//! are rebuilt on load.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use image::GrayImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::features::{Descriptors, DetectorKind, Keypoint, BINARY_BYTES, FLOAT_DIMS};
use crate::harris::HarrisCornerDetector;
use crate::trackable::Trackable;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed database: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing key `{0}`")]
    MissingKey(String),
    #[error("bad value for `{0}`")]
    BadValue(String),
}

/// Grayscale matrix payload.
#[derive(Debug, Serialize, Deserialize)]
struct MatRecord {
    rows: u32,
    cols: u32,
    data: Vec<u8>,
}

/// Descriptor matrix payload; the tag mirrors the detector kind.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
enum DescriptorsRecord {
    Binary { rows: usize, data: Vec<u8> },
    Float { rows: usize, data: Vec<f32> },
}

impl From<&Descriptors> for DescriptorsRecord {
    fn from(d: &Descriptors) -> Self {
        match d {
            Descriptors::Binary(rows) => Self::Binary {
                rows: rows.len(),
                data: rows.iter().flatten().copied().collect(),
            },
            Descriptors::Float(rows) => Self::Float {
                rows: rows.len(),
                data: rows.iter().flatten().copied().collect(),
            },
        }
    }
}

impl DescriptorsRecord {
    fn unpack(self, key: &str) -> Result<Descriptors, DatabaseError> {
        match self {
            Self::Binary { rows, data } => {
                if data.len() != rows * BINARY_BYTES {
                    return Err(DatabaseError::BadValue(key.to_string()));
                }
                Ok(Descriptors::Binary(
                    data.chunks_exact(BINARY_BYTES)
                        .map(|c| {
                            let mut row = [0u8; BINARY_BYTES];
                            row.copy_from_slice(c);
                            row
                        })
                        .collect(),
                ))
            }
            Self::Float { rows, data } => {
                if data.len() != rows * FLOAT_DIMS {
                    return Err(DatabaseError::BadValue(key.to_string()));
                }
                Ok(Descriptors::Float(
                    data.chunks_exact(FLOAT_DIMS)
                        .map(|c| {
                            let mut row = [0f32; FLOAT_DIMS];
                            row.copy_from_slice(c);
                            row
                        })
                        .collect(),
                ))
            }
        }
    }
}

/// Serialize the trackable library to `path`.
pub fn save_database(
    path: &Path,
    kind: DetectorKind,
    trackables: &[Trackable],
) -> Result<(), DatabaseError> {
    let mut root = Map::new();
    root.insert(
        "totalTrackables".into(),
        Value::from(trackables.len() as i64),
    );
    root.insert("featureType".into(), Value::from(kind.as_i32()));

    for (i, t) in trackables.iter().enumerate() {
        let image = MatRecord {
            rows: t.height(),
            cols: t.width(),
            data: t.base_buffer.to_vec(),
        };
        root.insert(format!("trackableId{i}"), Value::from(t.id));
        root.insert(format!("trackableFileName{i}"), Value::from(t.filename.clone()));
        root.insert(format!("trackableScale{i}"), Value::from(t.scale));
        root.insert(format!("trackableImage{i}"), serde_json::to_value(&image)?);
        root.insert(format!("trackableWidth{i}"), Value::from(t.width()));
        root.insert(format!("trackableHeight{i}"), Value::from(t.height()));
        root.insert(
            format!("trackableDescriptors{i}"),
            serde_json::to_value(DescriptorsRecord::from(&t.descriptors))?,
        );
        root.insert(
            format!("trackableFeaturePoints{i}"),
            serde_json::to_value(&t.feature_points)?,
        );
        root.insert(
            format!("trackableCornerPoints{i}"),
            serde_json::to_value(&t.corner_points[0])?,
        );
    }

    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), &Value::Object(root))?;
    Ok(())
}

fn take<'a>(root: &'a Map<String, Value>, key: &str) -> Result<&'a Value, DatabaseError> {
    root.get(key)
        .ok_or_else(|| DatabaseError::MissingKey(key.to_string()))
}

fn take_typed<T: serde::de::DeserializeOwned>(
    root: &Map<String, Value>,
    key: &str,
) -> Result<T, DatabaseError> {
    serde_json::from_value(take(root, key)?.clone())
        .map_err(|_| DatabaseError::BadValue(key.to_string()))
}

/// Deserialize a trackable library. Returns the stored detector kind and
/// fully rebuilt trackables with all tracking flags cleared. Nothing is
/// partially applied: any failure returns before a single trackable is
/// handed back.
pub fn load_database(
    path: &Path,
    harris: &HarrisCornerDetector,
) -> Result<(DetectorKind, Vec<Trackable>), DatabaseError> {
    let file = File::open(path)?;
    let root: Value = serde_json::from_reader(BufReader::new(file))?;
    let Value::Object(root) = root else {
        return Err(DatabaseError::BadValue("root".to_string()));
    };

    let total: usize = take_typed(&root, "totalTrackables")?;
    let kind_raw: i32 = take_typed(&root, "featureType")?;
    let kind = DetectorKind::from_i32(kind_raw)
        .ok_or_else(|| DatabaseError::BadValue("featureType".to_string()))?;

    let mut trackables = Vec::with_capacity(total);
    for i in 0..total {
        let id: i32 = take_typed(&root, &format!("trackableId{i}"))?;
        let filename: String = take_typed(&root, &format!("trackableFileName{i}"))?;
        let scale: f32 = take_typed(&root, &format!("trackableScale{i}"))?;
        let image: MatRecord = take_typed(&root, &format!("trackableImage{i}"))?;
        let width: u32 = take_typed(&root, &format!("trackableWidth{i}"))?;
        let height: u32 = take_typed(&root, &format!("trackableHeight{i}"))?;
        let descriptors: DescriptorsRecord =
            take_typed(&root, &format!("trackableDescriptors{i}"))?;
        let feature_points: Vec<Keypoint> =
            take_typed(&root, &format!("trackableFeaturePoints{i}"))?;
        let corner_points: Vec<[f32; 2]> =
            take_typed(&root, &format!("trackableCornerPoints{i}"))?;

        if image.cols != width || image.rows != height {
            return Err(DatabaseError::BadValue(format!("trackableImage{i}")));
        }
        let buffer: Arc<[u8]> = Arc::from(image.data.into_boxed_slice());
        let base = GrayImage::from_raw(width, height, buffer.to_vec())
            .ok_or_else(|| DatabaseError::BadValue(format!("trackableImage{i}")))?;
        let descriptors = descriptors.unpack(&format!("trackableDescriptors{i}"))?;
        if descriptors.len() != feature_points.len() {
            return Err(DatabaseError::BadValue(format!(
                "trackableFeaturePoints{i}"
            )));
        }

        trackables.push(Trackable::assemble(
            buffer,
            base,
            &filename,
            id,
            scale,
            feature_points,
            descriptors,
            Some(corner_points),
            harris,
        ));
    }

    Ok((kind, trackables))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureDetector;

    fn textured_trackable(id: i32, size: u32, kind: DetectorKind) -> Trackable {
        let img = GrayImage::from_fn(size, size, |x, y| {
            let v = 120.0
                + 60.0 * (x as f32 * 0.21 + id as f32).sin()
                + 55.0 * (y as f32 * 0.27).cos();
            image::Luma([v.clamp(0.0, 255.0) as u8])
        });
        let buffer: Arc<[u8]> = Arc::from(img.into_raw().into_boxed_slice());
        Trackable::from_buffer(
            buffer,
            &format!("marker{id}.png"),
            size,
            size,
            id,
            0.5,
            &FeatureDetector::new(kind),
            &HarrisCornerDetector::default(),
        )
        .unwrap()
    }

    #[test]
    fn roundtrip_preserves_base_level_exactly() {
        let dir = std::env::temp_dir().join("planartrack_db_roundtrip.json");
        let harris = HarrisCornerDetector::default();
        let kind = DetectorKind::Binary;
        let originals = vec![
            textured_trackable(3, 128, kind),
            textured_trackable(9, 160, kind),
        ];

        save_database(&dir, kind, &originals).unwrap();
        let (loaded_kind, loaded) = load_database(&dir, &harris).unwrap();
        std::fs::remove_file(&dir).ok();

        assert_eq!(loaded_kind, kind);
        assert_eq!(loaded.len(), 2);
        for (orig, back) in originals.iter().zip(&loaded) {
            assert_eq!(orig.id, back.id);
            assert_eq!(orig.filename, back.filename);
            assert_eq!(orig.scale, back.scale);
            assert_eq!(&orig.base_buffer[..], &back.base_buffer[..]);
            assert_eq!(orig.feature_points, back.feature_points);
            assert_eq!(orig.descriptors, back.descriptors);
            assert_eq!(orig.corner_points[0], back.corner_points[0]);
            // Rebuilt, not stored, but derived from identical inputs.
            assert_eq!(orig.corner_points[1], back.corner_points[1]);
            assert!(!back.is_detected && !back.is_tracking);
        }
    }

    #[test]
    fn float_descriptors_roundtrip() {
        let dir = std::env::temp_dir().join("planartrack_db_float.json");
        let harris = HarrisCornerDetector::default();
        let originals = vec![textured_trackable(1, 128, DetectorKind::Blob)];
        save_database(&dir, DetectorKind::Blob, &originals).unwrap();
        let (kind, loaded) = load_database(&dir, &harris).unwrap();
        std::fs::remove_file(&dir).ok();
        assert_eq!(kind, DetectorKind::Blob);
        assert_eq!(originals[0].descriptors, loaded[0].descriptors);
    }

    #[test]
    fn missing_file_fails_cleanly() {
        let err = load_database(
            Path::new("/nonexistent/planartrack.json"),
            &HarrisCornerDetector::default(),
        );
        assert!(matches!(err, Err(DatabaseError::Io(_))));
    }

    #[test]
    fn truncated_database_is_rejected() {
        let path = std::env::temp_dir().join("planartrack_db_truncated.json");
        std::fs::write(&path, r#"{"totalTrackables": 2, "featureType": 1}"#).unwrap();
        let err = load_database(&path, &HarrisCornerDetector::default());
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, Err(DatabaseError::MissingKey(_))));
    }
}
