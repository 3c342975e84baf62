use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hasher};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameHeader {
    pub step: u64,
    pub time: f64,
    pub dt: f64,
    pub partition: u32,
    pub vertex_count: u32,
    pub hash: u64,
}

impl FrameHeader {
    pub fn new(step: u64, time: f64, dt: f64, partition: usize, vertex_count: usize) -> Self {
        Self {
            step,
            time,
            dt,
            partition: partition as u32,
            vertex_count: vertex_count as u32,
            hash: 0,
        }
    }
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self {
            step: 0,
            time: 0.0,
            dt: 0.0,
            partition: 0,
            vertex_count: 0,
            hash: 0,
        }
    }
}

/// Per-partition output of one committed time step.
///
/// Only owned vertices are listed; ghost mirrors never appear in a frame.
/// All field vectors are aligned with `global_ids`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepFrame {
    pub header: FrameHeader,
    pub global_ids: Vec<u64>,
    pub elevation: Vec<f64>,
    pub drainage_area: Vec<f64>,
    pub discharge: Vec<f64>,
    pub erosion_deposition: Vec<f64>,
}

impl StepFrame {
    pub fn finalize(mut self) -> Self {
        self.header.vertex_count = self.global_ids.len() as u32;
        let hash = hash_frame(&self);
        self.header.hash = hash;
        self
    }
}

pub fn hash_frame(frame: &StepFrame) -> u64 {
    let mut hasher = RandomState::with_seeds(0, 0, 0, 0).build_hasher();
    hasher.write_u64(frame.header.step);
    hasher.write_u64(frame.header.time.to_bits());
    for (id, values) in frame.global_ids.iter().zip(vertex_rows(frame)) {
        hasher.write_u64(*id);
        for value in values {
            hasher.write_u64(value.to_bits());
        }
    }
    hasher.finish()
}

fn vertex_rows(frame: &StepFrame) -> impl Iterator<Item = [f64; 4]> + '_ {
    (0..frame.global_ids.len()).map(move |i| {
        [
            frame.elevation.get(i).copied().unwrap_or(0.0),
            frame.drainage_area.get(i).copied().unwrap_or(0.0),
            frame.discharge.get(i).copied().unwrap_or(0.0),
            frame.erosion_deposition.get(i).copied().unwrap_or(0.0),
        ]
    })
}

pub fn encode_frame(frame: &StepFrame) -> bincode::Result<Vec<u8>> {
    bincode::serialize(frame)
}

pub fn decode_frame(bytes: &[u8]) -> bincode::Result<StepFrame> {
    bincode::deserialize(bytes)
}

pub fn encode_frame_json(frame: &StepFrame) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}

pub fn decode_frame_json(data: &str) -> serde_json::Result<StepFrame> {
    serde_json::from_str(data)
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AssembleError {
    #[error("frames disagree on step: expected {expected}, found {found}")]
    StepMismatch { expected: u64, found: u64 },
    #[error("global vertex {0} reported by more than one partition")]
    DuplicateVertex(u64),
}

/// Whole-mesh view of one step, keyed by global vertex id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalField {
    pub step: u64,
    pub time: f64,
    pub elevation: BTreeMap<u64, f64>,
    pub drainage_area: BTreeMap<u64, f64>,
    pub discharge: BTreeMap<u64, f64>,
    pub erosion_deposition: BTreeMap<u64, f64>,
}

impl GlobalField {
    pub fn len(&self) -> usize {
        self.elevation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elevation.is_empty()
    }

    /// Elevation values in ascending global-id order.
    pub fn elevation_vec(&self) -> Vec<f64> {
        self.elevation.values().copied().collect()
    }

    pub fn drainage_area_vec(&self) -> Vec<f64> {
        self.drainage_area.values().copied().collect()
    }
}

/// Merge the frames every partition emitted for the same step.
pub fn assemble_global<'a>(
    frames: impl IntoIterator<Item = &'a StepFrame>,
) -> Result<GlobalField, AssembleError> {
    let mut field = GlobalField::default();
    let mut step = None;
    for frame in frames {
        match step {
            None => {
                step = Some(frame.header.step);
                field.step = frame.header.step;
                field.time = frame.header.time;
            }
            Some(expected) if expected != frame.header.step => {
                return Err(AssembleError::StepMismatch {
                    expected,
                    found: frame.header.step,
                });
            }
            Some(_) => {}
        }
        for (&id, [elevation, area, discharge, delta]) in
            frame.global_ids.iter().zip(vertex_rows(frame))
        {
            if field.elevation.insert(id, elevation).is_some() {
                return Err(AssembleError::DuplicateVertex(id));
            }
            field.drainage_area.insert(id, area);
            field.discharge.insert(id, discharge);
            field.erosion_deposition.insert(id, delta);
        }
    }
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(partition: usize, ids: &[u64], elevation: f64) -> StepFrame {
        StepFrame {
            header: FrameHeader::new(3, 1500.0, 500.0, partition, ids.len()),
            global_ids: ids.to_vec(),
            elevation: vec![elevation; ids.len()],
            drainage_area: vec![1.0; ids.len()],
            discharge: vec![0.5; ids.len()],
            erosion_deposition: vec![0.0; ids.len()],
        }
        .finalize()
    }

    #[test]
    fn hash_tracks_field_content() {
        let a = frame(0, &[1, 2, 3], 10.0);
        let b = frame(0, &[1, 2, 3], 10.0);
        let c = frame(0, &[1, 2, 3], 10.5);
        assert_eq!(a.header.hash, b.header.hash);
        assert_ne!(a.header.hash, c.header.hash);
    }

    #[test]
    fn binary_and_json_frames_decode() {
        let original = frame(1, &[7, 9], 3.25);
        let bytes = encode_frame(&original).expect("bincode encode");
        assert_eq!(decode_frame(&bytes).expect("bincode decode"), original);
        let text = encode_frame_json(&original).expect("json encode");
        assert_eq!(decode_frame_json(&text).expect("json decode"), original);
    }

    #[test]
    fn assemble_orders_by_global_id() {
        let left = frame(0, &[4, 0, 2], 1.0);
        let right = frame(1, &[1, 3], 2.0);
        let field = assemble_global([&left, &right]).expect("assemble");
        assert_eq!(field.len(), 5);
        assert_eq!(field.elevation_vec(), vec![1.0, 2.0, 1.0, 2.0, 1.0]);
    }

    #[test]
    fn assemble_rejects_duplicates_and_mixed_steps() {
        let left = frame(0, &[0, 1], 1.0);
        let overlap = frame(1, &[1, 2], 1.0);
        assert_eq!(
            assemble_global([&left, &overlap]),
            Err(AssembleError::DuplicateVertex(1))
        );

        let mut later = frame(1, &[5], 1.0);
        later.header.step = 4;
        assert_eq!(
            assemble_global([&left, &later]),
            Err(AssembleError::StepMismatch {
                expected: 3,
                found: 4
            })
        );
    }
}
