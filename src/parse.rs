//! Strict EDL JSON parsing and track normalization.
//!
//! The schema is deliberately a supported subset: unknown keys at the EDL and
//! clip level are rejected rather than ignored, so a document that renders is
//! a document whose every field was understood.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::error::{RenderError, RenderResult};
use crate::model::{
    Clip, Edl, EffectFilter, EffectSource, FilterControlPoint, GenerateKind, GenerateSource,
    MappingPair, MediaSource, Motion, ShapeControlPoint, SimpleEffect, Source, SubtitleSource,
    TextFormat, Track, TrackType, TransformSource, Transition,
};

const EDL_KEYS: &[&str] = &["fps", "width", "height", "clips"];

const CLIP_KEYS: &[&str] = &[
    "in",
    "out",
    "track",
    "source",
    "sources",
    "topFade",
    "tailFade",
    "topFadeYUV",
    "tailFadeYUV",
    "motion",
    "transition",
    "sync",
    "channelMap",
    "textFormat",
    "effects",
];

pub fn parse_file(path: impl AsRef<Path>) -> RenderResult<Edl> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| RenderError::io_open(path.display().to_string(), e))?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| RenderError::invalid_edl(format!("EDL is not valid JSON: {e}")))?;
    parse_value(&value)
}

pub fn parse_value(value: &Value) -> RenderResult<Edl> {
    let root = value
        .as_object()
        .ok_or_else(|| RenderError::invalid_edl("EDL must be a JSON object"))?;

    ensure_only_keys(root, "EDL", EDL_KEYS)?;

    let fps = get_positive_i32(root, "EDL", "fps")?;
    let width = get_positive_i32(root, "EDL", "width")?;
    let height = get_positive_i32(root, "EDL", "height")?;

    let mut clips = Vec::new();
    if let Some(raw_clips) = root.get("clips") {
        let raw_clips = raw_clips
            .as_array()
            .ok_or_else(|| RenderError::invalid_edl("clips must be an array in EDL"))?;
        for raw in raw_clips {
            let clip = parse_clip(raw)?;
            // Caption tracks carry teletext data the renderer never draws.
            if clip.track.kind == TrackType::Caption {
                continue;
            }
            clips.push(clip);
        }
    }

    let mut edl = Edl {
        fps,
        width,
        height,
        clips,
        tracks: BTreeMap::new(),
        fx_applies_to: BTreeMap::new(),
        duration: 0.0,
    };

    align_tracks(&mut edl)?;

    Ok(edl)
}

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

type Obj = serde_json::Map<String, Value>;

fn has_non_null(obj: &Obj, key: &str) -> bool {
    obj.get(key).is_some_and(|v| !v.is_null())
}

fn ensure_only_keys(obj: &Obj, object_name: &str, allowed: &[&str]) -> RenderResult<()> {
    let bad: Vec<&str> = obj
        .keys()
        .map(String::as_str)
        .filter(|k| !allowed.contains(k))
        .collect();
    if bad.is_empty() {
        Ok(())
    } else {
        Err(RenderError::invalid_edl(format!(
            "{object_name} contains unsupported keys: {}",
            bad.join(" ")
        )))
    }
}

/// Exactly one of `keys` must be present and non-null; returns which.
fn unique_non_null_key<'a>(
    obj: &Obj,
    object_name: &str,
    keys: &[&'a str],
) -> RenderResult<&'a str> {
    let found: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|k| has_non_null(obj, k))
        .collect();
    match found.as_slice() {
        [one] => Ok(one),
        [] => Err(RenderError::invalid_edl(format!(
            "{object_name} must contain one of the keys: {}",
            keys.join(" ")
        ))),
        many => Err(RenderError::invalid_edl(format!(
            "{object_name} can only contain one of the keys: {}",
            many.join(" ")
        ))),
    }
}

fn get_string(obj: &Obj, object_name: &str, key: &str) -> RenderResult<String> {
    let v = obj
        .get(key)
        .ok_or_else(|| RenderError::invalid_edl(format!("{object_name} must have {key}")))?;
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| RenderError::invalid_edl(format!("{key} must be a string in {object_name}")))
}

fn get_f64(obj: &Obj, object_name: &str, key: &str) -> RenderResult<f64> {
    let v = obj
        .get(key)
        .ok_or_else(|| RenderError::invalid_edl(format!("{object_name} must have {key}")))?;
    v.as_f64()
        .ok_or_else(|| RenderError::invalid_edl(format!("{key} must be a number in {object_name}")))
}

fn get_nonneg_f64(obj: &Obj, object_name: &str, key: &str) -> RenderResult<f64> {
    let v = get_f64(obj, object_name, key)?;
    if v < 0.0 {
        return Err(RenderError::invalid_edl(format!(
            "{key} must be non-negative in {object_name}: {v}"
        )));
    }
    Ok(v)
}

fn get_i64(obj: &Obj, object_name: &str, key: &str) -> RenderResult<i64> {
    let v = obj
        .get(key)
        .ok_or_else(|| RenderError::invalid_edl(format!("{object_name} must have {key}")))?;
    v.as_i64().ok_or_else(|| {
        RenderError::invalid_edl(format!("{key} must be an integer in {object_name}"))
    })
}

fn get_positive_i32(obj: &Obj, object_name: &str, key: &str) -> RenderResult<i32> {
    let v = get_i64(obj, object_name, key)?;
    if v <= 0 || v > i32::MAX as i64 {
        return Err(RenderError::invalid_edl(format!(
            "{key} must be positive in {object_name}: {v}"
        )));
    }
    Ok(v as i32)
}

fn get_object<'v>(obj: &'v Obj, object_name: &str, key: &str) -> RenderResult<&'v Obj> {
    let v = obj
        .get(key)
        .ok_or_else(|| RenderError::invalid_edl(format!("{object_name} must have {key}")))?;
    v.as_object().ok_or_else(|| {
        RenderError::invalid_edl(format!("{key} must be an object in {object_name}"))
    })
}

fn get_array<'v>(obj: &'v Obj, object_name: &str, key: &str) -> RenderResult<&'v Vec<Value>> {
    let v = obj
        .get(key)
        .ok_or_else(|| RenderError::invalid_edl(format!("{object_name} must have {key}")))?;
    v.as_array().ok_or_else(|| {
        RenderError::invalid_edl(format!("{key} must be an array in {object_name}"))
    })
}

/// `in`/`out` pair with `0 <= in < out`.
fn get_interval(obj: &Obj, object_name: &str) -> RenderResult<(f64, f64)> {
    let time_in = get_nonneg_f64(obj, object_name, "in")?;
    let time_out = get_nonneg_f64(obj, object_name, "out")?;
    if time_in >= time_out {
        return Err(RenderError::invalid_edl(format!(
            "in point must be before out point in {object_name}: in={time_in}, out={time_out}"
        )));
    }
    Ok((time_in, time_out))
}

fn opt_f64(obj: &Obj, object_name: &str, key: &str) -> RenderResult<Option<f64>> {
    if has_non_null(obj, key) {
        Ok(Some(get_f64(obj, object_name, key)?))
    } else {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Clip parsing
// ---------------------------------------------------------------------------

fn parse_clip(raw: &Value) -> RenderResult<Clip> {
    let obj = raw
        .as_object()
        .ok_or_else(|| RenderError::invalid_edl("each clip must be an object"))?;

    ensure_only_keys(obj, "clip", CLIP_KEYS)?;

    let (time_in, time_out) = get_interval(obj, "clip")?;
    let track = parse_track(get_object(obj, "clip", "track")?)?;

    let source_key = unique_non_null_key(obj, "clip", &["source", "sources"])?;
    let source = if source_key == "source" {
        parse_source(get_object(obj, "clip", "source")?, &track)?
    } else {
        let sources = get_array(obj, "clip", "sources")?;
        match sources.as_slice() {
            [] => return Err(RenderError::invalid_edl("sources array cannot be empty")),
            [one] => {
                let one = one.as_object().ok_or_else(|| {
                    RenderError::invalid_edl("each entry in sources must be an object")
                })?;
                parse_source(one, &track)?
            }
            _ => {
                return Err(RenderError::invalid_edl(
                    "multiple sources in a single clip are not supported",
                ));
            }
        }
    };

    let top_fade = opt_f64(obj, "clip", "topFade")?.unwrap_or(0.0);
    let tail_fade = opt_f64(obj, "clip", "tailFade")?.unwrap_or(0.0);
    let top_fade_yuv = opt_f64(obj, "clip", "topFadeYUV")?.unwrap_or(0.0);
    let tail_fade_yuv = opt_f64(obj, "clip", "tailFadeYUV")?.unwrap_or(0.0);
    let sync = opt_f64(obj, "clip", "sync")?.unwrap_or(0.0);

    let motion = if has_non_null(obj, "motion") {
        parse_motion(get_object(obj, "clip", "motion")?)?
    } else {
        Motion::default()
    };

    let transition = if has_non_null(obj, "transition") {
        Some(parse_transition(get_object(obj, "clip", "transition")?)?)
    } else {
        None
    };

    let text_format = if has_non_null(obj, "textFormat") {
        Some(parse_text_format(get_object(obj, "clip", "textFormat")?))
    } else {
        None
    };

    let channel_map = if has_non_null(obj, "channelMap") {
        parse_channel_map(get_object(obj, "clip", "channelMap")?)?
    } else {
        BTreeMap::new()
    };

    let effects = if has_non_null(obj, "effects") {
        parse_simple_effects(get_array(obj, "clip", "effects")?)?
    } else {
        Vec::new()
    };

    Ok(Clip {
        time_in,
        time_out,
        track,
        source,
        top_fade,
        tail_fade,
        top_fade_yuv,
        tail_fade_yuv,
        sync,
        motion,
        transition,
        text_format,
        channel_map,
        effects,
        is_null: false,
    })
}

fn parse_track(obj: &Obj) -> RenderResult<Track> {
    let kind = match get_string(obj, "track", "type")?.as_str() {
        "video" => TrackType::Video,
        "audio" => TrackType::Audio,
        "subtitle" => TrackType::Subtitle,
        "caption" => TrackType::Caption,
        "burnin" => TrackType::Burnin,
        other => {
            return Err(RenderError::invalid_edl(format!(
                "unknown track type: {other}"
            )));
        }
    };

    let number = get_positive_i32(obj, "track", "number")?;

    let subtype = if has_non_null(obj, "subtype") {
        get_string(obj, "track", "subtype")?
    } else {
        String::new()
    };

    let subnumber = if has_non_null(obj, "subnumber") {
        get_positive_i32(obj, "track", "subnumber")?
    } else {
        1
    };

    if subtype.is_empty() && subnumber != 1 {
        return Err(RenderError::invalid_edl(
            "track with subnumber must have subtype",
        ));
    }

    Ok(Track {
        kind,
        number,
        subtype,
        subnumber,
    })
}

fn parse_motion(obj: &Obj) -> RenderResult<Motion> {
    if has_non_null(obj, "bezier") {
        return Err(RenderError::invalid_edl(
            "motion bezier curves are not supported",
        ));
    }

    let mut motion = Motion::default();
    if let Some(v) = opt_f64(obj, "motion", "panX")? {
        motion.pan_x = v;
    }
    if let Some(v) = opt_f64(obj, "motion", "panY")? {
        motion.pan_y = v;
    }
    if let Some(v) = opt_f64(obj, "motion", "zoomX")? {
        motion.zoom_x = v;
    }
    if let Some(v) = opt_f64(obj, "motion", "zoomY")? {
        motion.zoom_y = v;
    }
    if let Some(v) = opt_f64(obj, "motion", "rotation")? {
        motion.rotation = v;
    }
    if let Some(v) = opt_f64(obj, "motion", "offset")? {
        motion.offset = v;
    }
    if let Some(v) = opt_f64(obj, "motion", "duration")? {
        motion.duration = v;
    }
    Ok(motion)
}

fn parse_transition(obj: &Obj) -> RenderResult<Transition> {
    if has_non_null(obj, "source") || has_non_null(obj, "sources") {
        return Err(RenderError::invalid_edl(
            "transition clips with sources are not supported",
        ));
    }

    let kind = if has_non_null(obj, "type") {
        get_string(obj, "transition", "type")?
    } else {
        String::new()
    };
    let duration = opt_f64(obj, "transition", "duration")?.unwrap_or(0.0);

    let mut parameters = BTreeMap::new();
    for (key, value) in obj {
        if key != "type" && key != "duration" {
            parameters.insert(key.clone(), value.clone());
        }
    }

    Ok(Transition {
        kind,
        duration,
        parameters,
    })
}

fn parse_text_format(obj: &Obj) -> TextFormat {
    let mut format = TextFormat::default();
    if let Some(v) = obj.get("font").and_then(Value::as_str) {
        format.font = v.to_string();
    }
    if let Some(v) = obj.get("fontSize").and_then(Value::as_f64) {
        format.font_size = v;
    }
    if let Some(v) = obj.get("halign").and_then(Value::as_str) {
        format.halign = v.to_string();
    }
    if let Some(v) = obj.get("valign").and_then(Value::as_str) {
        format.valign = v.to_string();
    }
    if let Some(v) = obj.get("textAYUV").and_then(Value::as_str) {
        format.text_ayuv = v.to_string();
    }
    if let Some(v) = obj.get("backAYUV").and_then(Value::as_str) {
        format.back_ayuv = v.to_string();
    }
    format
}

fn parse_channel_map(obj: &Obj) -> RenderResult<BTreeMap<u32, f64>> {
    let mut map = BTreeMap::new();
    for (key, value) in obj {
        let channel: u32 = key.parse().map_err(|_| {
            RenderError::invalid_edl(format!("channel map key must be an integer: {key}"))
        })?;
        if !(1..=128).contains(&channel) {
            return Err(RenderError::invalid_edl(format!(
                "channel map key must be between 1 and 128: {key}"
            )));
        }
        let level = value
            .as_f64()
            .ok_or_else(|| RenderError::invalid_edl("channel map values must be numbers"))?;
        if level != 1.0 {
            return Err(RenderError::invalid_edl(
                "channel map level must be 1.0 (other values not supported)",
            ));
        }
        map.insert(channel, level);
    }
    Ok(map)
}

fn parse_simple_effects(raw: &[Value]) -> RenderResult<Vec<SimpleEffect>> {
    let mut effects = Vec::with_capacity(raw.len());
    for entry in raw {
        let obj = entry
            .as_object()
            .ok_or_else(|| RenderError::invalid_edl("each effect must be an object"))?;
        let kind = get_string(obj, "effect", "type")?;
        let strength = if has_non_null(obj, "strength") {
            get_f64(obj, "effect", "strength")? as f32
        } else {
            1.0
        };
        effects.push(SimpleEffect { kind, strength });
    }
    Ok(effects)
}

// ---------------------------------------------------------------------------
// Source dispatch
// ---------------------------------------------------------------------------

fn parse_source(obj: &Obj, track: &Track) -> RenderResult<Source> {
    if track.subtype == "effects" {
        return Ok(Source::Effect(parse_effect_source(obj)?));
    }
    if matches!(track.subtype.as_str(), "transform" | "colour" | "pan" | "level") {
        return Ok(Source::Transform(parse_transform_source(obj)?));
    }
    if matches!(track.kind, TrackType::Subtitle | TrackType::Burnin) {
        return Ok(Source::Subtitle(parse_subtitle_source(obj)?));
    }
    if has_non_null(obj, "generate") {
        return Ok(Source::Generate(parse_generate_source(obj)?));
    }
    if has_non_null(obj, "location") {
        return Err(RenderError::invalid_edl("location sources are not supported"));
    }
    if has_non_null(obj, "uri") {
        return Ok(Source::Media(parse_media_source(obj)?));
    }
    Err(RenderError::invalid_edl("unknown source type"))
}

fn parse_media_source(obj: &Obj) -> RenderResult<MediaSource> {
    if let Some(motion) = obj.get("motion").and_then(Value::as_object) {
        if has_non_null(motion, "bezier") {
            return Err(RenderError::invalid_edl(
                "motion bezier curves are not supported",
            ));
        }
    }

    let uri = get_string(obj, "source", "uri")?;
    let (source_in, source_out) = get_interval(obj, "source")?;

    let mut source = MediaSource {
        uri,
        source_in,
        source_out,
        track_id: String::new(),
        width: 0,
        height: 0,
        fps: None,
        speed: 1.0,
        gamma: 1.0,
        audiomix: 1.0,
        flip: false,
    };

    if has_non_null(obj, "trackId") {
        source.track_id = get_string(obj, "source", "trackId")?;
    }
    if has_non_null(obj, "width") {
        source.width = get_positive_i32(obj, "source", "width")?;
    }
    if has_non_null(obj, "height") {
        source.height = get_positive_i32(obj, "source", "height")?;
    }
    if has_non_null(obj, "fps") {
        source.fps = Some(get_positive_i32(obj, "source", "fps")?);
    }
    if let Some(v) = opt_f64(obj, "source", "speed")? {
        source.speed = v;
    }
    if let Some(v) = opt_f64(obj, "source", "gamma")? {
        source.gamma = v;
    }
    if let Some(v) = opt_f64(obj, "source", "audiomix")? {
        source.audiomix = v;
    }
    if let Some(v) = obj.get("flip").and_then(Value::as_bool) {
        source.flip = v;
    }

    Ok(source)
}

fn parse_generate_source(obj: &Obj) -> RenderResult<GenerateSource> {
    let generate = get_object(obj, "source", "generate")?;
    let kind_str = get_string(generate, "generate", "type")?;

    // Only black frames can be synthesized.
    if kind_str != "black" {
        return Err(RenderError::invalid_edl(format!(
            "generate type '{kind_str}' is not supported, only 'black' is"
        )));
    }

    let (source_in, source_out) = get_interval(obj, "source")?;
    let width = get_positive_i32(obj, "source", "width")?;
    let height = get_positive_i32(obj, "source", "height")?;

    let mut parameters = BTreeMap::new();
    for (key, value) in generate {
        if key != "type" {
            parameters.insert(key.clone(), value.clone());
        }
    }

    Ok(GenerateSource {
        kind: GenerateKind::Black,
        source_in,
        source_out,
        width,
        height,
        parameters,
    })
}

fn parse_effect_source(obj: &Obj) -> RenderResult<EffectSource> {
    let kind = get_string(obj, "source", "type")?;
    let (source_in, source_out) = get_interval(obj, "source")?;

    let value = opt_f64(obj, "source", "value")?;

    let filters = if has_non_null(obj, "filters") {
        parse_effect_filters(get_array(obj, "source", "filters")?)?
    } else {
        Vec::new()
    };

    Ok(EffectSource {
        kind,
        source_in,
        source_out,
        value,
        filters,
    })
}

fn parse_effect_filters(raw: &[Value]) -> RenderResult<Vec<EffectFilter>> {
    let mut filters = Vec::with_capacity(raw.len());
    for entry in raw {
        let obj = entry
            .as_object()
            .ok_or_else(|| RenderError::invalid_edl("each filter must be an object"))?;
        let kind = get_string(obj, "filter", "type")?;
        let mut control_points = Vec::new();
        if has_non_null(obj, "controlPoints") {
            for cp in get_array(obj, "filter", "controlPoints")? {
                let cp = cp.as_object().ok_or_else(|| {
                    RenderError::invalid_edl("each filter control point must be an object")
                })?;
                let time = get_nonneg_f64(cp, "controlPoint", "point")?;
                let mut mapping = Vec::new();
                if has_non_null(cp, "mapping") {
                    for pair in get_array(cp, "controlPoint", "mapping")? {
                        let pair = pair.as_array().ok_or_else(|| {
                            RenderError::invalid_edl("mapping entries must be [src, dst] pairs")
                        })?;
                        if pair.len() != 2 {
                            return Err(RenderError::invalid_edl(
                                "mapping entries must be [src, dst] pairs",
                            ));
                        }
                        let src = pair[0].as_f64().ok_or_else(|| {
                            RenderError::invalid_edl("mapping src must be a number")
                        })?;
                        let dst = pair[1].as_f64().ok_or_else(|| {
                            RenderError::invalid_edl("mapping dst must be a number")
                        })?;
                        mapping.push(MappingPair {
                            src: src as f32,
                            dst: dst as f32,
                        });
                    }
                }
                control_points.push(FilterControlPoint { time, mapping });
            }
        }
        filters.push(EffectFilter {
            kind,
            control_points,
        });
    }
    Ok(filters)
}

fn parse_transform_source(obj: &Obj) -> RenderResult<TransformSource> {
    let (source_in, source_out) = get_interval(obj, "source")?;

    let mut control_points = Vec::new();
    if has_non_null(obj, "controlPoints") {
        for cp in get_array(obj, "source", "controlPoints")? {
            let cp = cp
                .as_object()
                .ok_or_else(|| RenderError::invalid_edl("each control point must be an object"))?;
            let mut point = ShapeControlPoint::default();
            if let Some(v) = cp.get("point").and_then(Value::as_f64) {
                point.point = v;
            }
            if let Some(v) = cp.get("panx").and_then(Value::as_f64) {
                point.pan_x = v;
            }
            if let Some(v) = cp.get("pany").and_then(Value::as_f64) {
                point.pan_y = v;
            }
            if let Some(v) = cp.get("zoomx").and_then(Value::as_f64) {
                point.zoom_x = v;
            }
            if let Some(v) = cp.get("zoomy").and_then(Value::as_f64) {
                point.zoom_y = v;
            }
            if let Some(v) = cp.get("rotate").and_then(Value::as_f64) {
                point.rotate = v;
            }
            if let Some(v) = cp.get("shape").and_then(Value::as_str) {
                point.shape = v.to_string();
            }
            control_points.push(point);
        }
    }

    Ok(TransformSource {
        source_in,
        source_out,
        control_points,
    })
}

fn parse_subtitle_source(obj: &Obj) -> RenderResult<SubtitleSource> {
    // Text may be null for gaps in multi-part subtitle clips.
    let text = if has_non_null(obj, "text") {
        Some(get_string(obj, "source", "text")?)
    } else {
        None
    };
    let (source_in, source_out) = get_interval(obj, "source")?;
    Ok(SubtitleSource {
        text,
        source_in,
        source_out,
    })
}

// ---------------------------------------------------------------------------
// Track alignment
// ---------------------------------------------------------------------------

/// Groups clips into tracks, fills gaps with null clips, extends every track
/// to the global duration, and renames effects tracks to `fx_N`.
fn align_tracks(edl: &mut Edl) -> RenderResult<()> {
    for clip in &edl.clips {
        let key = clip.track.key()?;
        let track = edl.tracks.entry(key.clone()).or_default();

        let track_duration = track.last().map_or(0.0, |c| c.time_out);
        if track_duration < clip.time_in {
            track.push(Clip::null(track_duration, clip.time_in, clip.track.clone()));
        } else if track_duration > clip.time_in {
            return Err(RenderError::invalid_edl(format!(
                "track {key} has overlapping clips at time {}",
                clip.time_in
            )));
        }
        track.push(clip.clone());
    }

    let edl_duration = edl
        .tracks
        .values()
        .filter_map(|t| t.last())
        .map(|c| c.time_out)
        .fold(0.0f64, f64::max);

    for track in edl.tracks.values_mut() {
        if let Some(last) = track.last() {
            if last.time_out < edl_duration {
                let track_id = last.track.clone();
                let gap_start = last.time_out;
                track.push(Clip::null(gap_start, edl_duration, track_id));
            }
        }
    }

    edl.duration = edl_duration;

    // Rename effects tracks to fx_N and record which video track each one
    // modifies (the parent is the same identity with subtype cleared).
    let effects_keys: Vec<String> = edl
        .tracks
        .keys()
        .filter(|k| k.starts_with("_effects_"))
        .cloned()
        .collect();

    for (fx_index, old_key) in effects_keys.iter().enumerate() {
        let fx_key = format!("fx_{fx_index}");
        let clips = edl.tracks.remove(old_key).unwrap_or_default();

        if let Some(first) = clips.first() {
            let mut parent = first.track.clone();
            parent.subtype.clear();
            parent.subnumber = 1;
            edl.fx_applies_to.insert(fx_key.clone(), parent.key()?);
        }

        edl.tracks.insert(fx_key, clips);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn media_clip(time_in: f64, time_out: f64, number: i32) -> Value {
        json!({
            "in": time_in,
            "out": time_out,
            "track": {"type": "video", "number": number},
            "source": {"uri": "a.mp4", "in": time_in, "out": time_out}
        })
    }

    fn basic_edl(clips: Vec<Value>) -> Value {
        json!({"fps": 30, "width": 1920, "height": 1080, "clips": clips})
    }

    #[test]
    fn parses_minimal_edl() {
        let edl = parse_value(&basic_edl(vec![media_clip(0.0, 3.0, 1)])).unwrap();
        assert_eq!(edl.fps, 30);
        assert_eq!(edl.clips.len(), 1);
        assert_eq!(edl.tracks["video_1"].len(), 1);
        assert!((edl.duration - 3.0).abs() < 1e-12);
        match &edl.clips[0].source {
            Source::Media(m) => assert_eq!(m.uri, "a.mp4"),
            other => panic!("expected media source, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_edl_keys() {
        let mut doc = basic_edl(vec![]);
        doc["frobnicate"] = json!(true);
        let err = parse_value(&doc).unwrap_err();
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn rejects_unknown_clip_keys() {
        let mut clip = media_clip(0.0, 1.0, 1);
        clip["font"] = json!("Helvetica");
        let err = parse_value(&basic_edl(vec![clip])).unwrap_err();
        assert!(err.to_string().contains("font"));
    }

    #[test]
    fn rejects_inverted_interval() {
        let clip = json!({
            "in": 2.0,
            "out": 1.0,
            "track": {"type": "video", "number": 1},
            "source": {"uri": "a.mp4", "in": 0.0, "out": 1.0}
        });
        assert!(parse_value(&basic_edl(vec![clip])).is_err());
    }

    #[test]
    fn rejects_source_and_sources_together() {
        let clip = json!({
            "in": 0.0,
            "out": 1.0,
            "track": {"type": "video", "number": 1},
            "source": {"uri": "a.mp4", "in": 0.0, "out": 1.0},
            "sources": [{"uri": "b.mp4", "in": 0.0, "out": 1.0}]
        });
        let err = parse_value(&basic_edl(vec![clip])).unwrap_err();
        assert!(err.to_string().contains("one of the keys"));
    }

    #[test]
    fn accepts_singleton_sources_array() {
        let clip = json!({
            "in": 0.0,
            "out": 1.0,
            "track": {"type": "video", "number": 1},
            "sources": [{"uri": "b.mp4", "in": 0.0, "out": 1.0}]
        });
        let edl = parse_value(&basic_edl(vec![clip])).unwrap();
        match &edl.clips[0].source {
            Source::Media(m) => assert_eq!(m.uri, "b.mp4"),
            other => panic!("expected media source, got {other:?}"),
        }
    }

    #[test]
    fn rejects_multi_source_array() {
        let clip = json!({
            "in": 0.0,
            "out": 1.0,
            "track": {"type": "video", "number": 1},
            "sources": [
                {"uri": "a.mp4", "in": 0.0, "out": 1.0},
                {"uri": "b.mp4", "in": 0.0, "out": 1.0}
            ]
        });
        assert!(parse_value(&basic_edl(vec![clip])).is_err());
    }

    #[test]
    fn rejects_location_source() {
        let clip = json!({
            "in": 0.0,
            "out": 1.0,
            "track": {"type": "video", "number": 1},
            "source": {"location": "tape://3", "in": 0.0, "out": 1.0}
        });
        let err = parse_value(&basic_edl(vec![clip])).unwrap_err();
        assert!(err.to_string().contains("location"));
    }

    #[test]
    fn rejects_non_black_generate() {
        let clip = json!({
            "in": 0.0,
            "out": 1.0,
            "track": {"type": "video", "number": 1},
            "source": {
                "generate": {"type": "testpattern"},
                "in": 0.0, "out": 1.0, "width": 1920, "height": 1080
            }
        });
        let err = parse_value(&basic_edl(vec![clip])).unwrap_err();
        assert!(err.to_string().contains("testpattern"));
    }

    #[test]
    fn accepts_black_generate() {
        let clip = json!({
            "in": 0.0,
            "out": 1.0,
            "track": {"type": "video", "number": 1},
            "source": {
                "generate": {"type": "black"},
                "in": 0.0, "out": 1.0, "width": 1920, "height": 1080
            }
        });
        let edl = parse_value(&basic_edl(vec![clip])).unwrap();
        assert!(matches!(
            edl.clips[0].source,
            Source::Generate(GenerateSource {
                kind: GenerateKind::Black,
                ..
            })
        ));
    }

    #[test]
    fn rejects_bezier_motion() {
        let mut clip = media_clip(0.0, 1.0, 1);
        clip["motion"] = json!({"panX": 0.1, "bezier": [[0, 0], [1, 1]]});
        let err = parse_value(&basic_edl(vec![clip])).unwrap_err();
        assert!(err.to_string().contains("bezier"));
    }

    #[test]
    fn rejects_overlapping_clips() {
        let edl = basic_edl(vec![media_clip(0.0, 3.0, 1), media_clip(2.0, 5.0, 1)]);
        let err = parse_value(&edl).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("overlapping"), "{msg}");
        assert!(msg.contains("video_1"), "{msg}");
        assert!(msg.contains('2'), "{msg}");
    }

    #[test]
    fn fills_gap_with_null_clip() {
        let edl = parse_value(&basic_edl(vec![
            media_clip(0.0, 1.0, 1),
            media_clip(2.0, 3.0, 1),
        ]))
        .unwrap();
        let track = &edl.tracks["video_1"];
        assert_eq!(track.len(), 3);
        assert!(track[1].is_null);
        assert!((track[1].time_in - 1.0).abs() < 1e-12);
        assert!((track[1].time_out - 2.0).abs() < 1e-12);
    }

    #[test]
    fn extends_short_tracks_to_edl_duration() {
        let edl = parse_value(&basic_edl(vec![
            media_clip(0.0, 5.0, 1),
            media_clip(0.0, 2.0, 2),
        ]))
        .unwrap();
        let short = &edl.tracks["video_2"];
        let tail = short.last().unwrap();
        assert!(tail.is_null);
        assert!((tail.time_out - 5.0).abs() < 1e-12);

        // Every track now covers [0, duration) with no gaps.
        for track in edl.tracks.values() {
            let mut cursor = 0.0;
            for clip in track {
                assert!((clip.time_in - cursor).abs() < 1e-12);
                cursor = clip.time_out;
            }
            assert!((cursor - edl.duration).abs() < 1e-12);
        }
    }

    #[test]
    fn renames_effects_tracks_and_records_parent() {
        let fx_clip = json!({
            "in": 1.0,
            "out": 3.0,
            "track": {"type": "video", "number": 1, "subtype": "effects"},
            "source": {"type": "brightness", "in": 1.0, "out": 3.0, "value": 1.5}
        });
        let edl = parse_value(&basic_edl(vec![media_clip(0.0, 4.0, 1), fx_clip])).unwrap();
        assert!(edl.tracks.contains_key("fx_0"));
        assert!(!edl.tracks.keys().any(|k| k.starts_with("_effects_")));
        assert_eq!(edl.fx_applies_to["fx_0"], "video_1");
    }

    #[test]
    fn skips_caption_clips() {
        let caption = json!({
            "in": 0.0,
            "out": 1.0,
            "track": {"type": "caption", "number": 1},
            "source": {"text": "hi", "in": 0.0, "out": 1.0}
        });
        let edl = parse_value(&basic_edl(vec![media_clip(0.0, 1.0, 1), caption])).unwrap();
        assert_eq!(edl.clips.len(), 1);
    }

    #[test]
    fn subtitle_clips_parse_but_do_not_fail() {
        let sub = json!({
            "in": 0.0,
            "out": 2.0,
            "track": {"type": "subtitle", "number": 1},
            "source": {"text": "hello", "in": 0.0, "out": 2.0}
        });
        let edl = parse_value(&basic_edl(vec![media_clip(0.0, 2.0, 1), sub])).unwrap();
        assert!(edl.tracks.contains_key("subtitle_1"));
        assert!(matches!(edl.clips[1].source, Source::Subtitle(_)));
    }

    #[test]
    fn channel_map_requires_unity_levels() {
        let mut clip = media_clip(0.0, 1.0, 1);
        clip["channelMap"] = json!({"1": 1.0, "2": 1.0});
        assert!(parse_value(&basic_edl(vec![clip.clone()])).is_ok());

        clip["channelMap"] = json!({"1": 0.5});
        assert!(parse_value(&basic_edl(vec![clip.clone()])).is_err());

        clip["channelMap"] = json!({"200": 1.0});
        assert!(parse_value(&basic_edl(vec![clip])).is_err());
    }

    #[test]
    fn subnumber_without_subtype_is_rejected() {
        let clip = json!({
            "in": 0.0,
            "out": 1.0,
            "track": {"type": "video", "number": 1, "subnumber": 2},
            "source": {"uri": "a.mp4", "in": 0.0, "out": 1.0}
        });
        let err = parse_value(&basic_edl(vec![clip])).unwrap_err();
        assert!(err.to_string().contains("subtype"));
    }

    #[test]
    fn inline_effects_default_strength() {
        let mut clip = media_clip(0.0, 1.0, 1);
        clip["effects"] = json!([
            {"type": "brightness", "strength": 1.4},
            {"type": "contrast"}
        ]);
        let edl = parse_value(&basic_edl(vec![clip])).unwrap();
        let effects = &edl.clips[0].effects;
        assert_eq!(effects.len(), 2);
        assert_eq!(effects[0].kind, "brightness");
        assert!((effects[0].strength - 1.4).abs() < 1e-6);
        assert!((effects[1].strength - 1.0).abs() < 1e-6);
    }

    #[test]
    fn effect_source_filters_parse() {
        let fx_clip = json!({
            "in": 0.0,
            "out": 2.0,
            "track": {"type": "video", "number": 1, "subtype": "effects"},
            "source": {
                "type": "brightness",
                "in": 0.0,
                "out": 2.0,
                "filters": [{
                    "type": "brightness",
                    "controlPoints": [
                        {"point": 0.0, "mapping": [[0.0, 0.0], [1.0, 0.5]]},
                        {"point": 2.0, "mapping": [[0.0, 0.0], [1.0, 1.0]]}
                    ]
                }]
            }
        });
        let edl = parse_value(&basic_edl(vec![media_clip(0.0, 2.0, 1), fx_clip])).unwrap();
        let fx_track = &edl.tracks["fx_0"];
        match &fx_track[0].source {
            Source::Effect(e) => {
                assert_eq!(e.filters.len(), 1);
                assert_eq!(e.filters[0].control_points.len(), 2);
                assert_eq!(
                    e.filters[0].control_points[0].mapping[1],
                    MappingPair { src: 1.0, dst: 0.5 }
                );
            }
            other => panic!("expected effect source, got {other:?}"),
        }
    }
}
