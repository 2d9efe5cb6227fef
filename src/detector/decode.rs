use crate::config::DetectorKind;
use crate::error::{PresenceError, Result};

/// How a model lays out its output tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// `[..., N, 5 + classes]`: cx, cy, w, h, objectness, class scores
    YoloRows,
    /// `[1, 4 + classes, anchors]`: box rows then one row per class
    YoloChannels,
    /// Any shape; the largest value is the presence score
    Score,
}

impl OutputLayout {
    pub fn for_kind(kind: DetectorKind) -> Self {
        match kind {
            DetectorKind::Yolov3 => OutputLayout::YoloRows,
            DetectorKind::Yolov8 => OutputLayout::YoloChannels,
            DetectorKind::Cascade | DetectorKind::Pose | DetectorKind::Static => {
                OutputLayout::Score
            }
        }
    }
}

/// Best person score in one output tensor.
///
/// For the YOLO layouts a candidate only counts when "person" is its
/// highest-scoring class; the caller compares the result to its threshold.
pub fn person_confidence(
    layout: OutputLayout,
    data: &[f32],
    shape: &[usize],
    person_class: usize,
) -> Result<f32> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        return Err(PresenceError::detector(
            "decode".to_string(),
            format!("shape {:?} does not match {} values", shape, data.len()),
        ));
    }

    match layout {
        OutputLayout::YoloRows => yolo_rows(data, shape, person_class),
        OutputLayout::YoloChannels => yolo_channels(data, shape, person_class),
        OutputLayout::Score => Ok(data
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(0.0f32, f32::max)),
    }
}

fn yolo_rows(data: &[f32], shape: &[usize], person_class: usize) -> Result<f32> {
    let row_len = *shape.last().unwrap_or(&0);
    if row_len <= 5 + person_class {
        return Err(PresenceError::detector(
            "decode".to_string(),
            format!("row length {} has no class {}", row_len, person_class),
        ));
    }

    let best = data
        .chunks_exact(row_len)
        .filter_map(|row| {
            let scores = &row[5..];
            let (class_id, score) = argmax(scores)?;
            (class_id == person_class).then_some(score)
        })
        .fold(0.0f32, f32::max);

    Ok(best)
}

fn yolo_channels(data: &[f32], shape: &[usize], person_class: usize) -> Result<f32> {
    let (channels, anchors) = match shape {
        [1, c, a] | [c, a] => (*c, *a),
        _ => {
            return Err(PresenceError::detector(
                "decode".to_string(),
                format!("unexpected YOLO output shape {:?}", shape),
            ))
        }
    };

    if channels <= 4 + person_class {
        return Err(PresenceError::detector(
            "decode".to_string(),
            format!("{} channels has no class {}", channels, person_class),
        ));
    }

    let classes = channels - 4;
    let mut best = 0.0f32;
    let mut scores = vec![0.0f32; classes];

    for anchor in 0..anchors {
        for (class_id, score) in scores.iter_mut().enumerate() {
            *score = data[(4 + class_id) * anchors + anchor];
        }
        if let Some((class_id, score)) = argmax(&scores) {
            if class_id == person_class {
                best = best.max(score);
            }
        }
    }

    Ok(best)
}

fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
}
