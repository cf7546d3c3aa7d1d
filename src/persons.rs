use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::{
    hash::Hash,
    io::ErrorKind,
    sync::{Arc, RwLock},
};

#[derive(Debug, Clone, Eq, Default, Serialize, Deserialize)]
pub struct Person {
    pub id: u64,

    pub name: String,
    pub display_name: String,
    /// Alternate names matched during lookup (nicknames, relationship
    /// terms like "mom").
    pub aliases: Vec<String>,
}

impl Hash for Person {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialEq for Person {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Person {
    /// Names this person answers to, canonical name first.
    pub fn known_names(&self) -> Vec<&str> {
        let mut names = vec![self.name.as_str()];
        if !self.display_name.is_empty() {
            names.push(self.display_name.as_str());
        }
        names.extend(self.aliases.iter().map(|a| a.as_str()));
        names
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PersonCreate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A face observed in a photo, or a manual person tag when no detector
/// ran (`manual` set, no descriptor).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaceDescriptor {
    pub id: u64,
    pub photo_id: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<u64>,

    #[serde(default)]
    pub manual: bool,

    /// Set once an auto-match pass has handled this face, so repeated
    /// passes do not re-suggest it.
    #[serde(default)]
    pub processed: bool,

    /// Detection confidence reported by the upstream detector.
    pub confidence: f32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FaceCreate {
    pub photo_id: u64,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<Vec<f32>>,
}

fn default_confidence() -> f32 {
    1.0
}

pub trait PersonStore: Send + Sync {
    fn all_persons(&self) -> anyhow::Result<Vec<Person>>;
    fn get_person(&self, id: u64) -> anyhow::Result<Option<Person>>;
    fn create_person(&self, create: PersonCreate) -> anyhow::Result<Person>;
    fn delete_person(&self, id: u64) -> anyhow::Result<()>;

    fn all_faces(&self) -> anyhow::Result<Vec<FaceDescriptor>>;
    fn get_face(&self, id: u64) -> anyhow::Result<Option<FaceDescriptor>>;
    fn create_face(&self, create: FaceCreate) -> anyhow::Result<FaceDescriptor>;

    /// Attach a face to a person. Already-attached faces are left as is.
    fn assign_face(&self, face_id: u64, person_id: u64) -> anyhow::Result<FaceDescriptor>;

    /// Detach a face and make it eligible for matching again.
    fn unassign_face(&self, face_id: u64) -> anyhow::Result<FaceDescriptor>;

    fn set_processed(&self, face_id: u64, processed: bool) -> anyhow::Result<()>;

    fn faces_for_person(&self, person_id: u64) -> anyhow::Result<Vec<FaceDescriptor>>;

    /// Record "person appears in photo" without a detected face.
    fn tag_photo(&self, person_id: u64, photo_id: u64) -> anyhow::Result<FaceDescriptor>;

    fn photo_ids_for_person(&self, person_id: u64) -> anyhow::Result<Vec<u64>>;
}

#[derive(Debug, Clone, Default)]
pub struct BackendCsv {
    persons: Arc<RwLock<Vec<Person>>>,
    faces: Arc<RwLock<Vec<FaceDescriptor>>>,
    persons_path: String,
    faces_path: String,
}

const PERSON_CSV_HEADERS: [&str; 4] = ["id", "name", "display_name", "aliases"];

const FACE_CSV_HEADERS: [&str; 8] = [
    "id",
    "photo_id",
    "person_id",
    "manual",
    "processed",
    "confidence",
    "bbox",
    "descriptor",
];

fn parse_aliases(cell: &str) -> Vec<String> {
    cell.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_floats(cell: &str) -> anyhow::Result<Vec<f32>> {
    cell.split_whitespace()
        .map(|v| v.parse::<f32>().map_err(|e| anyhow!("bad float in csv: {e}")))
        .collect()
}

fn join_floats(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl BackendCsv {
    pub fn load(persons_path: &str, faces_path: &str) -> anyhow::Result<Self> {
        for (path, headers) in [
            (persons_path, PERSON_CSV_HEADERS.as_slice()),
            (faces_path, FACE_CSV_HEADERS.as_slice()),
        ] {
            if let Err(err) = std::fs::metadata(path) {
                match err.kind() {
                    ErrorKind::NotFound => {
                        log::info!("Creating new database at {path}");
                        let mut csv_wrt = csv::Writer::from_path(path)?;
                        csv_wrt.write_record(headers)?;
                        csv_wrt.flush()?;
                    }
                    _ => Err(err)?,
                }
            }
        }

        let mut persons = vec![];
        let mut csv_reader = csv::Reader::from_path(persons_path)?;
        for record in csv_reader.records() {
            let record = record?;
            let id = record
                .get(0)
                .ok_or(anyhow!("couldnt get record id"))?
                .parse::<u64>()?;
            let name = record
                .get(1)
                .ok_or(anyhow!("couldnt get record name"))?
                .to_string();
            let display_name = record
                .get(2)
                .ok_or(anyhow!("couldnt get record display_name"))?
                .to_string();
            let aliases = parse_aliases(record.get(3).ok_or(anyhow!("couldnt get record aliases"))?);

            persons.push(Person {
                id,
                name,
                display_name,
                aliases,
            });
        }

        let mut faces = vec![];
        let mut csv_reader = csv::Reader::from_path(faces_path)?;
        for record in csv_reader.records() {
            let record = record?;
            let id = record
                .get(0)
                .ok_or(anyhow!("couldnt get record id"))?
                .parse::<u64>()?;
            let photo_id = record
                .get(1)
                .ok_or(anyhow!("couldnt get record photo_id"))?
                .parse::<u64>()?;
            let person_id = record
                .get(2)
                .ok_or(anyhow!("couldnt get record person_id"))?
                .to_string();
            let manual = record
                .get(3)
                .ok_or(anyhow!("couldnt get record manual"))?
                == "true";
            let processed = record
                .get(4)
                .ok_or(anyhow!("couldnt get record processed"))?
                == "true";
            let confidence = record
                .get(5)
                .ok_or(anyhow!("couldnt get record confidence"))?
                .parse::<f32>()?;
            let bbox = record
                .get(6)
                .ok_or(anyhow!("couldnt get record bbox"))?
                .to_string();
            let descriptor = record
                .get(7)
                .ok_or(anyhow!("couldnt get record descriptor"))?
                .to_string();

            let face = FaceDescriptor {
                id,
                photo_id,
                person_id: if person_id.is_empty() {
                    None
                } else {
                    Some(person_id.parse::<u64>()?)
                },
                manual,
                processed,
                confidence,
                bbox: if bbox.is_empty() {
                    None
                } else {
                    let values = parse_floats(&bbox)?;
                    if values.len() != 4 {
                        return Err(anyhow!("bbox cell must have 4 values, got {}", values.len()));
                    }
                    Some(BoundingBox {
                        x: values[0],
                        y: values[1],
                        width: values[2],
                        height: values[3],
                    })
                },
                descriptor: if descriptor.is_empty() {
                    None
                } else {
                    Some(parse_floats(&descriptor)?)
                },
            };

            faces.push(face);
        }

        Ok(BackendCsv {
            persons: Arc::new(RwLock::new(persons)),
            faces: Arc::new(RwLock::new(faces)),
            persons_path: persons_path.to_string(),
            faces_path: faces_path.to_string(),
        })
    }

    pub fn save_persons(&self) {
        let persons = self.persons.write().unwrap();

        let temp_path = format!("{}-tmp", &self.persons_path);
        let mut csv_wrt = csv::Writer::from_path(&temp_path).unwrap();
        csv_wrt.write_record(PERSON_CSV_HEADERS).unwrap();
        for person in persons.iter() {
            csv_wrt
                .write_record([
                    &person.id.to_string(),
                    &person.name,
                    &person.display_name,
                    &person.aliases.join(","),
                ])
                .unwrap();
        }
        csv_wrt.flush().unwrap();
        std::fs::rename(&temp_path, &self.persons_path).unwrap();
    }

    pub fn save_faces(&self) {
        let faces = self.faces.write().unwrap();

        let temp_path = format!("{}-tmp", &self.faces_path);
        let mut csv_wrt = csv::Writer::from_path(&temp_path).unwrap();
        csv_wrt.write_record(FACE_CSV_HEADERS).unwrap();
        for face in faces.iter() {
            csv_wrt
                .write_record([
                    &face.id.to_string(),
                    &face.photo_id.to_string(),
                    &face
                        .person_id
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                    &face.manual.to_string(),
                    &face.processed.to_string(),
                    &face.confidence.to_string(),
                    &face
                        .bbox
                        .as_ref()
                        .map(|b| join_floats(&[b.x, b.y, b.width, b.height]))
                        .unwrap_or_default(),
                    &face
                        .descriptor
                        .as_ref()
                        .map(|d| join_floats(d))
                        .unwrap_or_default(),
                ])
                .unwrap();
        }
        csv_wrt.flush().unwrap();
        std::fs::rename(&temp_path, &self.faces_path).unwrap();
    }

    #[cfg(test)]
    pub fn wipe_database(self) -> Self {
        let _ = std::fs::remove_file(&self.persons_path);
        let _ = std::fs::remove_file(&self.faces_path);
        *self.persons.write().unwrap() = vec![];
        *self.faces.write().unwrap() = vec![];
        self
    }
}

impl PersonStore for BackendCsv {
    fn all_persons(&self) -> anyhow::Result<Vec<Person>> {
        Ok(self.persons.read().unwrap().clone())
    }

    fn get_person(&self, id: u64) -> anyhow::Result<Option<Person>> {
        Ok(self
            .persons
            .read()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    fn create_person(&self, create: PersonCreate) -> anyhow::Result<Person> {
        let id = if let Some(last) = self.persons.write().unwrap().last() {
            last.id + 1
        } else {
            0
        };

        let person = Person {
            id,
            name: create.name,
            display_name: create.display_name.unwrap_or_default(),
            aliases: create.aliases.unwrap_or_default(),
        };

        self.persons.write().unwrap().push(person.clone());

        self.save_persons();

        Ok(person)
    }

    fn delete_person(&self, id: u64) -> anyhow::Result<()> {
        let mut persons = self.persons.write().unwrap();
        let found = persons.iter().position(|p| p.id == id).map(|idx| {
            persons.remove(idx);
        });
        drop(persons);

        if found.is_none() {
            return Ok(());
        }

        // Manual tags for the person disappear; detected faces go back
        // to unassigned.
        let mut faces = self.faces.write().unwrap();
        faces.retain(|f| !(f.manual && f.person_id == Some(id)));
        for face in faces.iter_mut() {
            if face.person_id == Some(id) {
                face.person_id = None;
                face.processed = false;
            }
        }
        drop(faces);

        self.save_persons();
        self.save_faces();

        Ok(())
    }

    fn all_faces(&self) -> anyhow::Result<Vec<FaceDescriptor>> {
        Ok(self.faces.read().unwrap().clone())
    }

    fn get_face(&self, id: u64) -> anyhow::Result<Option<FaceDescriptor>> {
        Ok(self
            .faces
            .read()
            .unwrap()
            .iter()
            .find(|f| f.id == id)
            .cloned())
    }

    fn create_face(&self, create: FaceCreate) -> anyhow::Result<FaceDescriptor> {
        let id = if let Some(last) = self.faces.write().unwrap().last() {
            last.id + 1
        } else {
            0
        };

        let face = FaceDescriptor {
            id,
            photo_id: create.photo_id,
            person_id: None,
            manual: false,
            processed: false,
            confidence: create.confidence,
            bbox: create.bbox,
            descriptor: create.descriptor,
        };

        self.faces.write().unwrap().push(face.clone());

        self.save_faces();

        Ok(face)
    }

    fn assign_face(&self, face_id: u64, person_id: u64) -> anyhow::Result<FaceDescriptor> {
        if self.get_person(person_id)?.is_none() {
            return Err(anyhow!("Person with id {} not found", person_id));
        }

        let mut faces = self.faces.write().unwrap();
        let face = faces
            .iter_mut()
            .find(|f| f.id == face_id)
            .ok_or_else(|| anyhow!("Face with id {} not found", face_id))?;

        if face.person_id == Some(person_id) && face.processed {
            return Ok(face.clone());
        }

        face.person_id = Some(person_id);
        face.processed = true;
        let result = face.clone();
        drop(faces);

        self.save_faces();

        Ok(result)
    }

    fn unassign_face(&self, face_id: u64) -> anyhow::Result<FaceDescriptor> {
        let mut faces = self.faces.write().unwrap();
        let face = faces
            .iter_mut()
            .find(|f| f.id == face_id)
            .ok_or_else(|| anyhow!("Face with id {} not found", face_id))?;

        if face.person_id.is_none() && !face.processed {
            return Ok(face.clone());
        }

        face.person_id = None;
        face.processed = false;
        let result = face.clone();
        drop(faces);

        self.save_faces();

        Ok(result)
    }

    fn set_processed(&self, face_id: u64, processed: bool) -> anyhow::Result<()> {
        let mut faces = self.faces.write().unwrap();
        let face = faces
            .iter_mut()
            .find(|f| f.id == face_id)
            .ok_or_else(|| anyhow!("Face with id {} not found", face_id))?;

        if face.processed == processed {
            return Ok(());
        }

        face.processed = processed;
        drop(faces);

        self.save_faces();

        Ok(())
    }

    fn faces_for_person(&self, person_id: u64) -> anyhow::Result<Vec<FaceDescriptor>> {
        Ok(self
            .faces
            .read()
            .unwrap()
            .iter()
            .filter(|f| f.person_id == Some(person_id))
            .cloned()
            .collect())
    }

    fn tag_photo(&self, person_id: u64, photo_id: u64) -> anyhow::Result<FaceDescriptor> {
        if self.get_person(person_id)?.is_none() {
            return Err(anyhow!("Person with id {} not found", person_id));
        }

        let faces = self.faces.read().unwrap();
        if let Some(existing) = faces
            .iter()
            .find(|f| f.manual && f.person_id == Some(person_id) && f.photo_id == photo_id)
        {
            return Ok(existing.clone());
        }
        drop(faces);

        let id = if let Some(last) = self.faces.write().unwrap().last() {
            last.id + 1
        } else {
            0
        };

        let face = FaceDescriptor {
            id,
            photo_id,
            person_id: Some(person_id),
            manual: true,
            processed: true,
            confidence: 1.0,
            bbox: None,
            descriptor: None,
        };

        self.faces.write().unwrap().push(face.clone());

        self.save_faces();

        Ok(face)
    }

    fn photo_ids_for_person(&self, person_id: u64) -> anyhow::Result<Vec<u64>> {
        let mut seen = std::collections::HashSet::new();
        Ok(self
            .faces
            .read()
            .unwrap()
            .iter()
            .filter(|f| f.person_id == Some(person_id))
            .map(|f| f.photo_id)
            .filter(|id| seen.insert(*id))
            .collect())
    }
}
