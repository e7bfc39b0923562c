//! Bulk upload analyzer.
//!
//! Classifies a flat list of uploaded files into a class, module and lecture
//! hierarchy plus an asset type, without holding the executor for more than
//! one file at a time.

/// Message-passing worker that runs [`analyze`] off the caller's task.
pub mod worker;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const UNSORTED: &str = "Unsorted";
pub const UNTITLED: &str = "Untitled";

const FORBIDDEN: [char; 7] = ['<', '>', ':', '"', '|', '?', '*'];

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer worker has shut down")]
    WorkerStopped,
    #[error("no previous submission to retry")]
    NothingToRetry,
}

/// File metadata as captured by the uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    #[serde(default)]
    pub relative_path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime: String,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, relative_path: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            relative_path: relative_path.into(),
            size,
            mime: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Audio,
    Slides,
    Transcript,
    Notes,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hierarchy {
    pub class: String,
    pub module: String,
    pub lecture: String,
}

/// Caller choices echoed back with the plan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadOptions {
    pub transcribe_audio: bool,
    pub process_slides: bool,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPlanItem {
    pub file: FileDescriptor,
    pub segments: Vec<String>,
    pub hierarchy: Hierarchy,
    pub asset_type: AssetType,
}

/// Distinct inferred nodes; modules and lectures are counted within their parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanCounts {
    pub classes: usize,
    pub modules: usize,
    pub lectures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPlan {
    pub total_bytes: u64,
    pub items: Vec<UploadPlanItem>,
    pub options: UploadOptions,
    pub counts: PlanCounts,
}

/// Splits `path` on either separator, dropping empty and `.` segments.
///
/// `..` pops the previous segment; at the root it is discarded.
pub fn normalize_segments(path: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for seg in path.split(['/', '\\']) {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(sanitize_segment(s)),
        }
    }
    out
}

pub fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if FORBIDDEN.contains(&c) { '_' } else { c })
        .collect()
}

pub fn infer_hierarchy(segments: &[String]) -> Hierarchy {
    let (class, module, lecture) = match segments {
        [] => (UNSORTED, UNSORTED, UNTITLED),
        [lecture] => (UNSORTED, UNSORTED, lecture.as_str()),
        [class, lecture] => (class.as_str(), class.as_str(), lecture.as_str()),
        [class, module, lecture, ..] => (class.as_str(), module.as_str(), lecture.as_str()),
    };
    Hierarchy {
        class: class.to_string(),
        module: module.to_string(),
        lecture: lecture.to_string(),
    }
}

pub fn infer_asset_type(name: &str) -> AssetType {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return AssetType::Unknown;
    };
    match ext.to_ascii_lowercase().as_str() {
        "mp3" | "wav" | "m4a" | "flac" => AssetType::Audio,
        "pdf" | "pptx" | "key" => AssetType::Slides,
        "vtt" | "srt" => AssetType::Transcript,
        "docx" | "txt" => AssetType::Notes,
        _ => AssetType::Unknown,
    }
}

/// Plans a single file. An empty relative path falls back to the file name.
pub fn classify(file: &FileDescriptor) -> UploadPlanItem {
    let path = if file.relative_path.is_empty() {
        &file.name
    } else {
        &file.relative_path
    };
    let segments = normalize_segments(path);
    UploadPlanItem {
        hierarchy: infer_hierarchy(&segments),
        asset_type: infer_asset_type(&file.name),
        segments,
        file: file.clone(),
    }
}

pub fn count_nodes(items: &[UploadPlanItem]) -> PlanCounts {
    let mut classes = HashSet::new();
    let mut modules = HashSet::new();
    let mut lectures = HashSet::new();
    for item in items {
        let h = &item.hierarchy;
        classes.insert(h.class.as_str());
        modules.insert((h.class.as_str(), h.module.as_str()));
        lectures.insert(h);
    }
    PlanCounts {
        classes: classes.len(),
        modules: modules.len(),
        lectures: lectures.len(),
    }
}

/// Rounds `processed / total` to three decimals.
pub fn progress_fraction(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (processed as f64 / total as f64 * 1000.0).round() / 1000.0
}

/// Classifies every file, reporting progress and yielding after each one.
pub async fn analyze<F>(files: &[FileDescriptor], options: &UploadOptions, mut progress: F) -> UploadPlan
where
    F: FnMut(f64),
{
    let total = files.len();
    let mut items = Vec::with_capacity(total);
    let mut total_bytes = 0u64;

    for (i, file) in files.iter().enumerate() {
        total_bytes = total_bytes.saturating_add(file.size);
        items.push(classify(file));
        progress(progress_fraction(i + 1, total));
        tokio::task::yield_now().await;
    }

    UploadPlan {
        total_bytes,
        counts: count_nodes(&items),
        items,
        options: options.clone(),
    }
}
