//! Class, module and lecture tree with optimistic bulk edits.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{api::ApiError, error::CartError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lecture {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleNode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub lectures: Vec<Lecture>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassNode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub modules: Vec<ModuleNode>,
}

/// Sparse patch where each `Some` field overwrites the lecture value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LecturePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,
}

impl LecturePatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, lecture: &mut Lecture) {
        if let Some(v) = &self.title {
            lecture.title = v.clone();
        }
        if let Some(v) = &self.description {
            lecture.description = (!v.is_empty()).then(|| v.clone());
        }
        if let Some(v) = &self.tags {
            lecture.tags = v.clone();
        }
        if let Some(v) = self.published {
            lecture.published = v;
        }
    }
}

/// Wire body for a bulk lecture edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkLectureUpdate {
    pub lecture_ids: Vec<String>,
    pub patch: LecturePatch,
}

/// An applied optimistic edit and the pre-edit lectures needed to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticEdit {
    pub request: BulkLectureUpdate,
    previous: Vec<Lecture>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CatalogCounts {
    pub classes: usize,
    pub modules: usize,
    pub lectures: usize,
}

/// Catalog read and bulk-write endpoints.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn list_classes(&self) -> Result<Vec<ClassNode>, ApiError>;
    async fn bulk_update_lectures(&self, request: &BulkLectureUpdate) -> Result<(), ApiError>;
}

#[derive(Debug, Default)]
pub struct Catalog {
    classes: Vec<ClassNode>,
    by_lecture: HashMap<String, (usize, usize, usize)>,
}

impl Catalog {
    pub fn new(classes: Vec<ClassNode>) -> Self {
        let mut catalog = Self::default();
        catalog.replace(classes);
        catalog
    }

    pub fn replace(&mut self, classes: Vec<ClassNode>) {
        self.classes = classes;
        self.by_lecture.clear();
        for (ci, class) in self.classes.iter().enumerate() {
            for (mi, module) in class.modules.iter().enumerate() {
                for (li, lecture) in module.lectures.iter().enumerate() {
                    self.by_lecture.insert(lecture.id.clone(), (ci, mi, li));
                }
            }
        }
    }

    pub fn classes(&self) -> &[ClassNode] {
        &self.classes
    }

    pub fn lecture(&self, id: &str) -> Option<&Lecture> {
        let (ci, mi, li) = *self.by_lecture.get(id)?;
        self.classes.get(ci)?.modules.get(mi)?.lectures.get(li)
    }

    pub fn lectures_in_module(&self, module_id: &str) -> Vec<&Lecture> {
        self.classes
            .iter()
            .flat_map(|c| c.modules.iter())
            .filter(|m| m.id == module_id)
            .flat_map(|m| m.lectures.iter())
            .collect()
    }

    pub fn counts(&self) -> CatalogCounts {
        CatalogCounts {
            classes: self.classes.len(),
            modules: self.classes.iter().map(|c| c.modules.len()).sum(),
            lectures: self.by_lecture.len(),
        }
    }

    /// Applies `patch` to every known lecture in `ids`, snapshotting each first.
    ///
    /// Unknown ids are skipped and left out of the returned request.
    pub fn apply_optimistic(&mut self, ids: &[String], patch: LecturePatch) -> OptimisticEdit {
        let mut applied = Vec::new();
        let mut previous = Vec::new();
        for id in ids {
            if let Some(lecture) = self.lecture_mut(id) {
                previous.push(lecture.clone());
                patch.apply_to(lecture);
                applied.push(id.clone());
            }
        }
        OptimisticEdit {
            request: BulkLectureUpdate {
                lecture_ids: applied,
                patch,
            },
            previous,
        }
    }

    /// Restores every lecture touched by `edit` to its snapshot.
    pub fn rollback(&mut self, edit: OptimisticEdit) {
        for before in edit.previous.into_iter().rev() {
            if let Some(lecture) = self.lecture_mut(&before.id) {
                *lecture = before;
            }
        }
    }

    fn lecture_mut(&mut self, id: &str) -> Option<&mut Lecture> {
        let (ci, mi, li) = *self.by_lecture.get(id)?;
        self.classes
            .get_mut(ci)?
            .modules
            .get_mut(mi)?
            .lectures
            .get_mut(li)
    }
}

/// Couples a shared [`Catalog`] with its gateway.
#[derive(Clone)]
pub struct CatalogEditor {
    catalog: Arc<Mutex<Catalog>>,
    api: Arc<dyn CatalogApi>,
}

impl CatalogEditor {
    pub fn new(catalog: Catalog, api: Arc<dyn CatalogApi>) -> Self {
        Self {
            catalog: Arc::new(Mutex::new(catalog)),
            api,
        }
    }

    pub fn catalog(&self) -> Arc<Mutex<Catalog>> {
        Arc::clone(&self.catalog)
    }

    /// Reloads the tree from the gateway.
    pub async fn refresh(&self) -> Result<CatalogCounts, CartError> {
        let classes = self
            .api
            .list_classes()
            .await
            .map_err(|e| CartError::transport("load the catalog", e))?;
        let mut catalog = self.catalog.lock().await;
        catalog.replace(classes);
        Ok(catalog.counts())
    }

    /// Applies a bulk edit locally, submits it, and rolls back on failure.
    ///
    /// Returns how many lectures were updated.
    pub async fn bulk_update(&self, ids: &[String], patch: LecturePatch) -> Result<usize, CartError> {
        if patch.is_empty() {
            return Err(CartError::Validation("nothing to change".to_string()));
        }

        let edit = self.catalog.lock().await.apply_optimistic(ids, patch);
        if edit.request.lecture_ids.is_empty() {
            return Ok(0);
        }

        match self.api.bulk_update_lectures(&edit.request).await {
            Ok(()) => {
                let count = edit.request.lecture_ids.len();
                info!(count, "bulk lecture update committed");
                Ok(count)
            }
            Err(err) => {
                warn!(error = %err, "bulk lecture update failed; rolling back");
                self.catalog.lock().await.rollback(edit);
                Err(CartError::transport("update lectures", err))
            }
        }
    }
}
