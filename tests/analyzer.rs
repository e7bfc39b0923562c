use std::time::Duration;

use lecturecart::analyzer::{
    AnalyzerError, AssetType, FileDescriptor, Hierarchy, PlanCounts, UploadOptions, analyze,
    infer_asset_type, infer_hierarchy, normalize_segments, progress_fraction, sanitize_segment,
    worker::{AnalyzerMessage, AnalyzerWorker},
};

fn hierarchy(class: &str, module: &str, lecture: &str) -> Hierarchy {
    Hierarchy {
        class: class.to_string(),
        module: module.to_string(),
        lecture: lecture.to_string(),
    }
}

fn segs(path: &str) -> Vec<String> {
    normalize_segments(path)
}

#[test]
fn normalization_resolves_parent_segments_within_root() {
    assert_eq!(segs("a//b/./c"), vec!["a", "b", "c"]);
    assert_eq!(segs("a/b/../c"), vec!["a", "c"]);
    assert_eq!(segs("../../a/b"), vec!["a", "b"]);
    assert_eq!(segs("a/../../.."), Vec::<String>::new());
    assert_eq!(segs("Class\\Module\\file.mp3"), vec!["Class", "Module", "file.mp3"]);
    assert!(segs("").is_empty());
}

#[test]
fn sanitization_replaces_reserved_characters() {
    assert_eq!(sanitize_segment(r#"Q&A: <Week|1>?*"x""#), r#"Q&A_ _Week_1____x_"#);
    assert_eq!(segs("Intro: Part 1/notes?.txt"), vec!["Intro_ Part 1", "notes_.txt"]);
}

#[test]
fn hierarchy_follows_segment_count() {
    assert_eq!(
        infer_hierarchy(&segs("Physics/Mechanics/Lecture 1/audio.mp3")),
        hierarchy("Physics", "Mechanics", "Lecture 1")
    );
    assert_eq!(
        infer_hierarchy(&segs("Physics/Mechanics/Lecture 1")),
        hierarchy("Physics", "Mechanics", "Lecture 1")
    );
    assert_eq!(
        infer_hierarchy(&segs("Physics/intro.pdf")),
        hierarchy("Physics", "Physics", "intro.pdf")
    );
    assert_eq!(
        infer_hierarchy(&segs("intro.pdf")),
        hierarchy("Unsorted", "Unsorted", "intro.pdf")
    );
    assert_eq!(
        infer_hierarchy(&segs("../..")),
        hierarchy("Unsorted", "Unsorted", "Untitled")
    );
}

#[test]
fn asset_type_comes_from_the_extension_only() {
    assert_eq!(infer_asset_type("talk.MP3"), AssetType::Audio);
    assert_eq!(infer_asset_type("talk.flac"), AssetType::Audio);
    assert_eq!(infer_asset_type("deck.key"), AssetType::Slides);
    assert_eq!(infer_asset_type("deck.pptx"), AssetType::Slides);
    assert_eq!(infer_asset_type("captions.srt"), AssetType::Transcript);
    assert_eq!(infer_asset_type("notes.docx"), AssetType::Notes);
    assert_eq!(infer_asset_type("video.mp4"), AssetType::Unknown);
    assert_eq!(infer_asset_type("README"), AssetType::Unknown);
}

#[test]
fn progress_is_rounded_to_three_decimals() {
    assert_eq!(progress_fraction(1, 3), 0.333);
    assert_eq!(progress_fraction(2, 3), 0.667);
    assert_eq!(progress_fraction(3, 3), 1.0);
}

fn sample_files() -> Vec<FileDescriptor> {
    vec![
        FileDescriptor::new("audio.mp3", "Physics/Mechanics/Lecture 1/audio.mp3", 1000),
        FileDescriptor::new("slides.pdf", "Physics/Mechanics/Lecture 1/slides.pdf", 500),
        FileDescriptor::new("audio.wav", "Physics/Mechanics/Lecture 2/audio.wav", 2000),
        FileDescriptor::new("intro.vtt", "Physics/intro.vtt", 10),
        FileDescriptor::new("loose.txt", "", 5),
    ]
}

#[tokio::test]
async fn analyze_builds_plan_and_reports_progress() {
    let files = sample_files();
    let options = UploadOptions {
        transcribe_audio: true,
        ..UploadOptions::default()
    };
    let mut progress = Vec::new();

    let plan = analyze(&files, &options, |f| progress.push(f)).await;

    assert_eq!(progress, vec![0.2, 0.4, 0.6, 0.8, 1.0]);
    assert_eq!(plan.total_bytes, 3515);
    assert_eq!(plan.options, options);
    assert_eq!(plan.items.len(), 5);
    assert_eq!(plan.items[1].asset_type, AssetType::Slides);
    assert_eq!(plan.items[3].hierarchy, hierarchy("Physics", "Physics", "intro.vtt"));
    assert_eq!(plan.items[4].hierarchy, hierarchy("Unsorted", "Unsorted", "loose.txt"));
    assert_eq!(
        plan.counts,
        PlanCounts {
            classes: 2,
            modules: 3,
            lectures: 4,
        }
    );
}

#[tokio::test]
async fn worker_delivers_progress_then_plan() {
    let mut worker = AnalyzerWorker::spawn();
    let mut ticket = worker
        .submit(sample_files(), UploadOptions::default())
        .await
        .expect("submit");
    let id = ticket.correlation_id();

    let mut fractions = Vec::new();
    let plan = loop {
        match ticket.recv().await.expect("message") {
            AnalyzerMessage::Progress {
                correlation_id,
                fraction,
            } => {
                assert_eq!(correlation_id, id);
                fractions.push(fraction);
            }
            AnalyzerMessage::Completed {
                correlation_id,
                plan,
            } => {
                assert_eq!(correlation_id, id);
                break plan;
            }
        }
    };
    assert_eq!(fractions.len(), 5);
    assert_eq!(plan.items.len(), 5);

    let again = worker.retry().await.expect("retry");
    assert_ne!(again.correlation_id(), id);
    let replayed = again.wait().await.expect("plan");
    assert_eq!(replayed.items, plan.items);

    worker.shutdown().await;
}

#[tokio::test]
async fn retry_without_submission_is_an_error() {
    let mut worker = AnalyzerWorker::spawn();
    assert!(matches!(
        worker.retry().await,
        Err(AnalyzerError::NothingToRetry)
    ));
}

#[tokio::test]
async fn stop_mid_analysis_abandons_the_plan_and_retry_recovers() {
    let files: Vec<FileDescriptor> = (0..20_000)
        .map(|n| FileDescriptor::new(format!("{n}.mp3"), format!("C/M/L{n}/{n}.mp3"), 1))
        .collect();

    let mut worker = AnalyzerWorker::spawn();
    let ticket = worker
        .submit(files, UploadOptions::default())
        .await
        .expect("submit");
    worker.stop().await;
    assert!(!worker.is_running());

    let plan = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
        .await
        .expect("ticket resolved");
    assert!(plan.is_none());

    let ticket = worker.retry().await.expect("retry after stop");
    assert!(worker.is_running());
    let plan = tokio::time::timeout(Duration::from_secs(30), ticket.wait())
        .await
        .expect("retry finished")
        .expect("full plan");
    assert_eq!(plan.items.len(), 20_000);
    assert_eq!(plan.total_bytes, 20_000);
    assert_eq!(plan.counts.lectures, 20_000);

    worker.shutdown().await;
}

#[test]
fn escaping_and_reserved_paths_follow_the_documented_cases() {
    let escape = lecturecart::analyzer::classify(&FileDescriptor::new(
        "escape.txt",
        "../../escape.txt",
        1,
    ));
    assert_eq!(escape.hierarchy, hierarchy("Unsorted", "Unsorted", "escape.txt"));
    assert_eq!(escape.asset_type, AssetType::Notes);

    let weird = lecturecart::analyzer::classify(&FileDescriptor::new("x.pdf", "weird<name>/x.pdf", 1));
    assert_eq!(weird.segments, vec!["weird_name_", "x.pdf"]);
    assert_eq!(weird.asset_type, AssetType::Slides);
    assert_eq!(weird.hierarchy, hierarchy("weird_name_", "weird_name_", "x.pdf"));
}
