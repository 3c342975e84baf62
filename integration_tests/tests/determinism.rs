mod common;

use std::collections::BTreeMap;

use common::{column_stripes, config, run_with_frames, split, valley};
use landscape_core::RunOptions;
use landscape_proto::{assemble_global, decode_frame, encode_frame, StepFrame};

const THREE_STEPS: &str = r#"{
    "time": { "end": 3000.0, "dt": 1000.0 },
    "stream_power": { "erodibility": 1e-5 },
    "forcing": { "uplift": 1e-3, "sea_level": 21.0 }
}"#;

fn frames_by_step(frames: &[StepFrame]) -> BTreeMap<(u64, u32), u64> {
    frames
        .iter()
        .map(|frame| ((frame.header.step, frame.header.partition), frame.header.hash))
        .collect()
}

#[test]
fn repeated_runs_publish_identical_frames() {
    let (nx, ny) = (10, 8);
    let (mesh, elevation) = valley(nx, ny, 100.0);
    let meshes = split(&mesh, &column_stripes(nx, ny, 3));

    let (reports_a, frames_a) =
        run_with_frames(&meshes, &elevation, RunOptions::new(config(THREE_STEPS)));
    let (reports_b, frames_b) =
        run_with_frames(&meshes, &elevation, RunOptions::new(config(THREE_STEPS)));

    assert_eq!(frames_a.len(), 9);
    assert_eq!(frames_by_step(&frames_a), frames_by_step(&frames_b));
    for (a, b) in reports_a.iter().zip(&reports_b) {
        assert_eq!(a.elevation, b.elevation);
        assert_eq!(a.metrics, b.metrics);
    }

    for step in 1..=3 {
        let pick = |frames: &[StepFrame]| -> Vec<StepFrame> {
            frames
                .iter()
                .filter(|frame| frame.header.step == step)
                .cloned()
                .collect()
        };
        let field_a = assemble_global(&pick(&frames_a)).expect("assemble");
        let field_b = assemble_global(&pick(&frames_b)).expect("assemble");
        assert_eq!(field_a, field_b);
        assert_eq!(field_a.len(), nx * ny);
        assert_eq!(field_a.time, 1000.0 * step as f64);
    }
}

#[test]
fn frames_survive_the_wire() -> anyhow::Result<()> {
    let (nx, ny) = (6, 5);
    let (mesh, elevation) = valley(nx, ny, 50.0);
    let meshes = split(&mesh, &column_stripes(nx, ny, 2));
    let (_, frames) = run_with_frames(&meshes, &elevation, RunOptions::new(config(THREE_STEPS)));

    for frame in &frames {
        let decoded = decode_frame(&encode_frame(frame)?)?;
        assert_eq!(&decoded, frame);
        assert_eq!(decoded.header.vertex_count as usize, decoded.global_ids.len());
    }
    Ok(())
}
