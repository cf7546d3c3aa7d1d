use crate::eid::Eid;
use crate::parse_tags;
use crate::semantic::{self, storage::VectorStorage};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Instant,
};

#[derive(Debug, Clone, Eq, Default, Serialize, Deserialize)]
pub struct Photo {
    pub id: u64,
    pub uuid: Eid,

    pub path: String,
    pub file_name: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,

    pub taken_at: Option<DateTime<Utc>>,
}

impl Hash for Photo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialEq for Photo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Photo {
    /// Text fed to the embedding model, or `None` when the photo has no
    /// describable content yet.
    pub fn caption(&self) -> Option<String> {
        semantic::preprocess_caption(&self.title, &self.description, &self.tags)
    }

    /// Change-detection hash over the describable content.
    pub fn caption_hash(&self) -> u64 {
        semantic::caption_hash(&self.title, &self.description, &self.tags)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PhotoCreate {
    pub path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PhotoUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_tags: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<DateTime<Utc>>,
}

/// An embedding persisted for a photo, keyed by the content hash it was
/// computed from.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub photo_id: u64,
    pub content_hash: u64,
    pub vector: Vec<f32>,
}

pub trait PhotoStore: Send + Sync {
    fn all(&self) -> anyhow::Result<Vec<Photo>>;
    fn get(&self, id: u64) -> anyhow::Result<Option<Photo>>;
    fn get_by_uuid(&self, uuid: &str) -> anyhow::Result<Option<Photo>>;
    fn create(&self, photo: PhotoCreate) -> anyhow::Result<Photo>;
    fn update(&self, id: u64, update: PhotoUpdate) -> anyhow::Result<Photo>;
    fn delete(&self, id: u64) -> anyhow::Result<()>;

    /// All embeddings persisted for the given model.
    fn all_embeddings(&self, model_id: &[u8; 32]) -> anyhow::Result<Vec<StoredEmbedding>>;

    /// Photos with describable content but no current embedding for the
    /// given model. Stale embeddings (content changed since they were
    /// computed) count as missing.
    fn unprocessed(&self, model_id: &[u8; 32]) -> anyhow::Result<Vec<Photo>>;
}

#[derive(Debug, Clone, Default)]
pub struct BackendCsv {
    list: Arc<RwLock<Vec<Photo>>>,
    path: String,
    vectors_path: PathBuf,
}

const CSV_HEADERS: [&str; 8] = [
    "id",
    "uuid",
    "path",
    "file_name",
    "title",
    "description",
    "tags",
    "taken_at",
];

impl BackendCsv {
    pub fn load(path: &str, vectors_path: PathBuf) -> anyhow::Result<Self> {
        if let Err(err) = std::fs::metadata(path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new photo database at {path}");
                    let mut csv_wrt = csv::Writer::from_path(path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(path)?;
        let iter = csv_reader.records();

        let mut photos = vec![];
        for record in iter {
            let record = record?;
            let id = record
                .get(0)
                .ok_or(anyhow!("couldnt get record id"))?
                .parse::<u64>()?;
            let uuid = record
                .get(1)
                .ok_or(anyhow!("couldnt get record uuid"))?
                .into();
            let file_path = record
                .get(2)
                .ok_or(anyhow!("couldnt get record path"))?
                .to_string();
            let file_name = record
                .get(3)
                .ok_or(anyhow!("couldnt get record file_name"))?
                .to_string();
            let title = record
                .get(4)
                .ok_or(anyhow!("couldnt get record title"))?
                .to_string();
            let description = record
                .get(5)
                .ok_or(anyhow!("couldnt get record description"))?
                .to_string();
            let tags = parse_tags(
                record
                    .get(6)
                    .ok_or(anyhow!("couldnt get record tags"))?
                    .to_string(),
            );
            let taken_at = record
                .get(7)
                .ok_or(anyhow!("couldnt get record taken_at"))?
                .to_string();

            let photo = Photo {
                id,
                uuid,
                path: file_path,
                file_name,
                title,
                description,
                tags,
                taken_at: if taken_at.is_empty() {
                    None
                } else {
                    Some(DateTime::parse_from_rfc3339(&taken_at)?.with_timezone(&Utc))
                },
            };

            photos.push(photo);
        }

        log::debug!(
            "took {}ms to read photo csv",
            now.elapsed().as_micros() as f64 / 1000.0
        );

        let mgr = BackendCsv {
            list: Arc::new(RwLock::new(photos)),
            path: path.to_string(),
            vectors_path,
        };

        Ok(mgr)
    }

    pub fn save(&self) {
        let photos = self.list.write().unwrap();

        let temp_path = format!("{}-tmp", &self.path);
        let mut csv_wrt = csv::Writer::from_path(&temp_path).unwrap();
        csv_wrt.write_record(CSV_HEADERS).unwrap();
        for photo in photos.iter() {
            csv_wrt
                .write_record([
                    &photo.id.to_string(),
                    &photo.uuid.to_string(),
                    &photo.path,
                    &photo.file_name,
                    &photo.title,
                    &photo.description,
                    &photo.tags.join(","),
                    &photo
                        .taken_at
                        .map(|dt| dt.to_rfc3339())
                        .unwrap_or_default(),
                ])
                .unwrap();
        }
        csv_wrt.flush().unwrap();
        std::fs::rename(&temp_path, &self.path).unwrap();
    }

    #[cfg(test)]
    pub fn wipe_database(self) -> Self {
        let _ = std::fs::remove_file(&self.path);
        *self.list.write().unwrap() = vec![];
        self
    }
}

fn file_name_of(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

impl PhotoStore for BackendCsv {
    fn all(&self) -> anyhow::Result<Vec<Photo>> {
        Ok(self.list.read().unwrap().clone())
    }

    fn get(&self, id: u64) -> anyhow::Result<Option<Photo>> {
        Ok(self
            .list
            .read()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    fn get_by_uuid(&self, uuid: &str) -> anyhow::Result<Option<Photo>> {
        Ok(self
            .list
            .read()
            .unwrap()
            .iter()
            .find(|p| p.uuid.as_str() == uuid)
            .cloned())
    }

    fn create(&self, photo_create: PhotoCreate) -> anyhow::Result<Photo> {
        let id = if let Some(last_photo) = self.list.write().unwrap().last() {
            last_photo.id + 1
        } else {
            0
        };

        let mut photo_create = photo_create;
        if let Some(ref mut tags) = photo_create.tags {
            let mut seen = HashSet::new();
            tags.retain(|item| seen.insert(item.clone()));
        };

        let photo = Photo {
            id,
            uuid: Eid::new(),
            file_name: file_name_of(&photo_create.path),
            path: photo_create.path,
            title: photo_create.title.unwrap_or_default(),
            description: photo_create.description.unwrap_or_default(),
            tags: photo_create.tags.unwrap_or_default(),
            taken_at: photo_create.taken_at,
        };

        self.list.write().unwrap().push(photo.clone());

        self.save();

        Ok(photo)
    }

    fn update(&self, id: u64, photo_update: PhotoUpdate) -> anyhow::Result<Photo> {
        let mut photos = self.list.write().unwrap();

        let photo_idx = photos
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| anyhow::anyhow!("Photo with id {} not found", id))?;

        let photo = &mut photos[photo_idx];

        if let Some(title) = photo_update.title {
            photo.title = title;
        }
        if let Some(descr) = photo_update.description {
            photo.description = descr;
        }

        if let Some(tags) = photo_update.tags {
            photo.tags = tags;
            let mut seen = HashSet::new();
            photo.tags.retain(|item| seen.insert(item.clone()));
        }

        if let Some(delete_tags) = photo_update.remove_tags {
            photo
                .tags
                .retain(|item| !delete_tags.iter().any(|t| t == item));
        }

        if let Some(mut tags) = photo_update.append_tags {
            photo.tags.append(&mut tags);
            let mut seen = HashSet::new();
            photo.tags.retain(|item| seen.insert(item.clone()));
        }

        if let Some(taken_at) = photo_update.taken_at {
            photo.taken_at = Some(taken_at);
        }

        let result = photo.clone();
        drop(photos);

        self.save();

        Ok(result)
    }

    fn delete(&self, id: u64) -> anyhow::Result<()> {
        let mut photos = self.list.write().unwrap();
        let result = photos.iter().position(|p| p.id == id).map(|idx| {
            photos.remove(idx);
            true
        });

        drop(photos);

        if result.is_some() {
            self.save();
        }

        Ok(())
    }

    fn all_embeddings(&self, model_id: &[u8; 32]) -> anyhow::Result<Vec<StoredEmbedding>> {
        let storage = VectorStorage::new(self.vectors_path.clone());
        if !storage.exists() {
            return Ok(vec![]);
        }

        match storage.load_entries(model_id) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                // Incompatible or corrupted vector files mean no usable
                // embeddings; the pipeline will regenerate them.
                log::warn!("ignoring vector store at {:?}: {err}", self.vectors_path);
                Ok(vec![])
            }
        }
    }

    fn unprocessed(&self, model_id: &[u8; 32]) -> anyhow::Result<Vec<Photo>> {
        let embedded: HashMap<u64, u64> = self
            .all_embeddings(model_id)?
            .into_iter()
            .map(|e| (e.photo_id, e.content_hash))
            .collect();

        let photos = self.list.read().unwrap();
        Ok(photos
            .iter()
            .filter(|photo| photo.caption().is_some())
            .filter(|photo| embedded.get(&photo.id) != Some(&photo.caption_hash()))
            .cloned()
            .collect())
    }
}
