//! End-to-end checks of the parse → normalize → instruction pipeline using
//! JSON fixtures, without touching any real media.

use framewright::{
    parse_value, EffectKind, InstructionGenerator, InstructionKind, RenderError, TransitionKind,
};
use serde_json::json;

#[test]
fn three_second_clip_yields_ninety_draw_frames() {
    let edl = parse_value(&json!({
        "fps": 30, "width": 1920, "height": 1080,
        "clips": [{
            "in": 0, "out": 3,
            "track": {"type": "video", "number": 1},
            "source": {"uri": "counter.mp4", "in": 0, "out": 3}
        }]
    }))
    .unwrap();

    let generator = InstructionGenerator::new(&edl);
    let instructions: Vec<_> = generator.iter().collect();
    assert_eq!(instructions.len(), 90);

    for (i, instruction) in instructions.iter().enumerate() {
        assert_eq!(instruction.kind, InstructionKind::DrawFrame);
        assert_eq!(instruction.uri, "counter.mp4");
        assert_eq!(instruction.source_frame, i as i64);
        assert_eq!(instruction.fade, 1.0);
        assert!(instruction.effects.is_empty());
        assert_eq!(instruction.transition.kind, TransitionKind::None);
    }
}

#[test]
fn total_frames_rounds_from_latest_out_point() {
    let edl = parse_value(&json!({
        "fps": 25, "width": 1280, "height": 720,
        "clips": [
            {
                "in": 0.0, "out": 1.5,
                "track": {"type": "video", "number": 1},
                "source": {"uri": "a.mp4", "in": 0.0, "out": 1.5}
            },
            {
                "in": 0.0, "out": 2.02,
                "track": {"type": "video", "number": 2},
                "source": {"uri": "b.mp4", "in": 0.0, "out": 2.02}
            }
        ]
    }))
    .unwrap();

    let generator = InstructionGenerator::new(&edl);
    assert_eq!(generator.total_frames(), (2.02f64 * 25.0).round() as i64);
    assert_eq!(generator.iter().count() as i64, generator.total_frames());
}

#[test]
fn track_coverage_has_no_gaps_or_overlaps() {
    let edl = parse_value(&json!({
        "fps": 30, "width": 1920, "height": 1080,
        "clips": [
            {
                "in": 1.0, "out": 2.0,
                "track": {"type": "video", "number": 1},
                "source": {"uri": "a.mp4", "in": 0.0, "out": 1.0}
            },
            {
                "in": 3.0, "out": 5.0,
                "track": {"type": "video", "number": 1},
                "source": {"uri": "a.mp4", "in": 0.0, "out": 2.0}
            },
            {
                "in": 0.0, "out": 1.0,
                "track": {"type": "audio", "number": 1},
                "source": {"uri": "a.mp4", "in": 0.0, "out": 1.0}
            }
        ]
    }))
    .unwrap();

    assert!((edl.duration - 5.0).abs() < 1e-12);

    for (key, track) in &edl.tracks {
        let mut cursor = 0.0f64;
        for clip in track {
            assert!(
                (clip.time_in - cursor).abs() < 1e-12,
                "track {key} has a gap at {cursor}"
            );
            assert!(clip.time_out > clip.time_in);
            cursor = clip.time_out;
        }
        assert!(
            (cursor - edl.duration).abs() < 1e-12,
            "track {key} ends early at {cursor}"
        );
    }

    // The leading and trailing gaps became null clips.
    let video = &edl.tracks["video_1"];
    assert!(video[0].is_null);
    assert!(video[2].is_null);
    let audio = &edl.tracks["audio_1"];
    assert!(audio.last().unwrap().is_null);
}

#[test]
fn instruction_streams_are_bit_identical_across_runs() {
    let doc = json!({
        "fps": 30, "width": 1920, "height": 1080,
        "clips": [
            {
                "in": 0.0, "out": 2.0,
                "track": {"type": "video", "number": 1},
                "source": {"uri": "a.mp4", "in": 0.5, "out": 2.5, "fps": 60},
                "topFade": 0.25,
                "transition": {"type": "slide", "duration": 0.5}
            },
            {
                "in": 2.0, "out": 4.0,
                "track": {"type": "video", "number": 1},
                "source": {"uri": "b.mp4", "in": 0.0, "out": 2.0},
                "tailFade": 1.0
            }
        ]
    });

    let edl_a = parse_value(&doc).unwrap();
    let edl_b = parse_value(&doc).unwrap();
    let gen_a = InstructionGenerator::new(&edl_a);
    let gen_b = InstructionGenerator::new(&edl_b);

    let stream_a: Vec<String> = gen_a
        .iter()
        .map(|i| serde_json::to_string(&i).unwrap())
        .collect();
    let stream_b: Vec<String> = gen_b
        .iter()
        .map(|i| serde_json::to_string(&i).unwrap())
        .collect();

    assert_eq!(stream_a, stream_b);
}

#[test]
fn overlapping_clips_report_track_and_time() {
    let result = parse_value(&json!({
        "fps": 30, "width": 1920, "height": 1080,
        "clips": [
            {
                "in": 0, "out": 3,
                "track": {"type": "video", "number": 1},
                "source": {"uri": "a.mp4", "in": 0, "out": 3}
            },
            {
                "in": 2, "out": 5,
                "track": {"type": "video", "number": 1},
                "source": {"uri": "a.mp4", "in": 0, "out": 3}
            }
        ]
    }));

    match result {
        Err(RenderError::InvalidEdl(msg)) => {
            assert!(msg.contains("video_1"), "{msg}");
            assert!(msg.contains('2'), "{msg}");
        }
        other => panic!("expected InvalidEdl, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn effects_track_is_attached_to_its_parent_video() {
    let edl = parse_value(&json!({
        "fps": 30, "width": 1920, "height": 1080,
        "clips": [
            {
                "in": 0.0, "out": 4.0,
                "track": {"type": "video", "number": 1},
                "source": {"uri": "a.mp4", "in": 0.0, "out": 4.0}
            },
            {
                "in": 1.0, "out": 3.0,
                "track": {"type": "video", "number": 1, "subtype": "effects"},
                "source": {"type": "brightness", "in": 1.0, "out": 3.0, "value": 1.5}
            }
        ]
    }))
    .unwrap();

    assert_eq!(edl.fx_applies_to["fx_0"], "video_1");

    let generator = InstructionGenerator::new(&edl);

    // Frame 30 = t=1.0s, inside the effects window.
    let inside = generator.instruction_at(30);
    assert_eq!(inside.kind, InstructionKind::DrawFrame);
    assert_eq!(inside.effects.len(), 1);
    assert_eq!(inside.effects[0].kind, EffectKind::Brightness);
    assert!((inside.effects[0].strength - 1.5).abs() < 1e-6);

    // Frames outside the window carry no effects.
    assert!(generator.instruction_at(0).effects.is_empty());
    assert!(generator.instruction_at(119).effects.is_empty());
}

#[test]
fn fade_boundary_values_hold() {
    let edl = parse_value(&json!({
        "fps": 30, "width": 1920, "height": 1080,
        "clips": [{
            "in": 0.0, "out": 5.0,
            "track": {"type": "video", "number": 1},
            "source": {"uri": "a.mp4", "in": 0.0, "out": 5.0},
            "topFade": 1.0, "tailFade": 1.5
        }]
    }))
    .unwrap();
    let generator = InstructionGenerator::new(&edl);

    // fade(clip.in) >= 0, fade(clip.in + topFade) == 1.
    assert!(generator.instruction_at(0).fade >= 0.0);
    assert_eq!(generator.instruction_at(30).fade, 1.0);

    // Everything in [0, 1].
    for instruction in generator.iter() {
        assert!((0.0..=1.0).contains(&instruction.fade));
    }
}

#[test]
fn mixed_timeline_instruction_kinds() {
    let edl = parse_value(&json!({
        "fps": 10, "width": 640, "height": 360,
        "clips": [
            {
                "in": 0.0, "out": 1.0,
                "track": {"type": "video", "number": 1},
                "source": {"uri": "a.mp4", "in": 0.0, "out": 1.0}
            },
            {
                "in": 2.0, "out": 3.0,
                "track": {"type": "video", "number": 1},
                "source": {
                    "generate": {"type": "black"},
                    "in": 2.0, "out": 3.0, "width": 640, "height": 360
                }
            },
            {
                "in": 0.0, "out": 3.0,
                "track": {"type": "subtitle", "number": 1},
                "source": {"text": "hello", "in": 0.0, "out": 3.0}
            }
        ]
    }))
    .unwrap();
    let generator = InstructionGenerator::new(&edl);
    assert_eq!(generator.total_frames(), 30);

    // Media clip, then a gap of generated black, then generated black again.
    assert_eq!(generator.instruction_at(5).kind, InstructionKind::DrawFrame);
    assert_eq!(
        generator.instruction_at(15).kind,
        InstructionKind::GenerateColor
    );
    assert_eq!(
        generator.instruction_at(25).kind,
        InstructionKind::GenerateColor
    );
}
