use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;

use lecturecart::{
    api::ApiError,
    catalog::{
        BulkLectureUpdate, Catalog, CatalogApi, CatalogCounts, CatalogEditor, ClassNode, Lecture,
        LecturePatch, ModuleNode,
    },
    error::CartError,
};

#[derive(Default)]
struct FakeCatalogApi {
    fail: AtomicBool,
    requests: Mutex<Vec<BulkLectureUpdate>>,
}

#[async_trait]
impl CatalogApi for FakeCatalogApi {
    async fn list_classes(&self) -> Result<Vec<ClassNode>, ApiError> {
        Ok(sample_classes())
    }

    async fn bulk_update_lectures(&self, request: &BulkLectureUpdate) -> Result<(), ApiError> {
        self.requests.lock().expect("lock").push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                body: "boom".to_string(),
            });
        }
        Ok(())
    }
}

fn lecture(id: &str, title: &str, description: Option<&str>) -> Lecture {
    Lecture {
        id: id.to_string(),
        title: title.to_string(),
        description: description.map(str::to_string),
        tags: vec!["draft".to_string()],
        published: false,
    }
}

fn sample_classes() -> Vec<ClassNode> {
    vec![
        ClassNode {
            id: "c1".to_string(),
            title: "Physics".to_string(),
            modules: vec![
                ModuleNode {
                    id: "m1".to_string(),
                    title: "Mechanics".to_string(),
                    lectures: vec![
                        lecture("l1", "Kinematics", Some("motion")),
                        lecture("l2", "Dynamics", None),
                    ],
                },
                ModuleNode {
                    id: "m2".to_string(),
                    title: "Waves".to_string(),
                    lectures: vec![lecture("l3", "Sound", None)],
                },
            ],
        },
        ClassNode {
            id: "c2".to_string(),
            title: "History".to_string(),
            modules: vec![],
        },
    ]
}

#[test]
fn lookups_and_counts_cover_the_whole_tree() {
    let catalog = Catalog::new(sample_classes());
    assert_eq!(
        catalog.counts(),
        CatalogCounts {
            classes: 2,
            modules: 2,
            lectures: 3,
        }
    );
    assert_eq!(catalog.lecture("l3").map(|l| l.title.as_str()), Some("Sound"));
    assert!(catalog.lecture("missing").is_none());

    let titles: Vec<&str> = catalog
        .lectures_in_module("m1")
        .iter()
        .map(|l| l.title.as_str())
        .collect();
    assert_eq!(titles, vec!["Kinematics", "Dynamics"]);
}

#[test]
fn empty_description_clears_the_field() {
    let mut catalog = Catalog::new(sample_classes());
    let edit = catalog.apply_optimistic(
        &["l1".to_string()],
        LecturePatch {
            description: Some(String::new()),
            ..LecturePatch::default()
        },
    );
    assert_eq!(catalog.lecture("l1").and_then(|l| l.description.clone()), None);

    catalog.rollback(edit);
    assert_eq!(
        catalog.lecture("l1").and_then(|l| l.description.clone()),
        Some("motion".to_string())
    );
}

#[tokio::test]
async fn bulk_update_commits_on_success() {
    let api = Arc::new(FakeCatalogApi::default());
    let editor = CatalogEditor::new(Catalog::default(), api.clone());
    assert_eq!(editor.refresh().await.expect("refresh").lectures, 3);

    let patch = LecturePatch {
        published: Some(true),
        tags: Some(vec!["final".to_string()]),
        ..LecturePatch::default()
    };
    let updated = editor
        .bulk_update(&["l1".to_string(), "nope".to_string(), "l3".to_string()], patch.clone())
        .await
        .expect("update");
    assert_eq!(updated, 2);

    let requests = api.requests.lock().expect("lock").clone();
    assert_eq!(
        requests,
        vec![BulkLectureUpdate {
            lecture_ids: vec!["l1".to_string(), "l3".to_string()],
            patch,
        }]
    );

    let catalog = editor.catalog();
    let catalog = catalog.lock().await;
    for id in ["l1", "l3"] {
        let lecture = catalog.lecture(id).expect("lecture");
        assert!(lecture.published);
        assert_eq!(lecture.tags, vec!["final".to_string()]);
    }
    assert!(!catalog.lecture("l2").expect("lecture").published);
}

#[tokio::test]
async fn failed_bulk_update_rolls_back() {
    let api = Arc::new(FakeCatalogApi::default());
    api.fail.store(true, Ordering::SeqCst);
    let editor = CatalogEditor::new(Catalog::new(sample_classes()), api.clone());

    let err = editor
        .bulk_update(
            &["l1".to_string(), "l2".to_string()],
            LecturePatch {
                title: Some("Renamed".to_string()),
                description: Some("new".to_string()),
                ..LecturePatch::default()
            },
        )
        .await
        .expect_err("gateway failure");
    assert!(matches!(
        err,
        CartError::Transport {
            action: "update lectures",
            ..
        }
    ));

    let catalog = editor.catalog();
    let catalog = catalog.lock().await;
    assert_eq!(catalog.lecture("l1").expect("l1"), &lecture("l1", "Kinematics", Some("motion")));
    assert_eq!(catalog.lecture("l2").expect("l2"), &lecture("l2", "Dynamics", None));
}

#[tokio::test]
async fn empty_patch_and_unknown_ids_skip_the_gateway() {
    let api = Arc::new(FakeCatalogApi::default());
    let editor = CatalogEditor::new(Catalog::new(sample_classes()), api.clone());

    assert!(matches!(
        editor
            .bulk_update(&["l1".to_string()], LecturePatch::default())
            .await,
        Err(CartError::Validation(_))
    ));
    assert_eq!(
        editor
            .bulk_update(
                &["ghost".to_string()],
                LecturePatch {
                    published: Some(true),
                    ..LecturePatch::default()
                },
            )
            .await
            .expect("no-op"),
        0
    );
    assert!(api.requests.lock().expect("lock").is_empty());
}

#[test]
fn rollback_restores_the_exact_pre_edit_lecture() {
    let mut classes = sample_classes();
    classes[0].modules[1].lectures[0].description = Some(String::new());
    let mut catalog = Catalog::new(classes);
    let before = catalog.lecture("l3").expect("l3").clone();

    let ids = ["l3".to_string(), "l3".to_string()];
    let edit = catalog.apply_optimistic(
        &ids,
        LecturePatch {
            description: Some("filled".to_string()),
            published: Some(true),
            ..LecturePatch::default()
        },
    );
    assert_eq!(
        catalog.lecture("l3").and_then(|l| l.description.as_deref()),
        Some("filled")
    );

    catalog.rollback(edit);
    assert_eq!(catalog.lecture("l3").expect("l3"), &before);
    assert_eq!(
        catalog.lecture("l3").and_then(|l| l.description.clone()),
        Some(String::new())
    );
}
