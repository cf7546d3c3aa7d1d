use crate::persons::{self, BoundingBox, FaceCreate, PersonCreate, PersonStore};
use crate::photos::{self, PhotoCreate, PhotoStore, PhotoUpdate};
use chrono::{TimeZone, Utc};
use std::path::PathBuf;

fn fresh_photos() -> (photos::BackendCsv, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let csv_path = tmp.path().join("photos.csv");
    let mgr =
        photos::BackendCsv::load(csv_path.to_str().unwrap(), tmp.path().join("vectors.bin"))
            .unwrap();
    (mgr, tmp)
}

fn fresh_persons() -> (persons::BackendCsv, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let mgr = persons::BackendCsv::load(
        tmp.path().join("persons.csv").to_str().unwrap(),
        tmp.path().join("faces.csv").to_str().unwrap(),
    )
    .unwrap();
    (mgr, tmp)
}

fn seed(mgr: &photos::BackendCsv, count: usize) {
    for i in 0..count {
        mgr.create(PhotoCreate {
            path: format!("/camera/{i}.jpg"),
            title: Some(format!("Title {i}")),
            description: Some(format!("Description {i}")),
            tags: Some(vec!["all".to_string(), format!("tag{i}")]),
            ..Default::default()
        })
        .unwrap();
    }
}

// --- save / load roundtrip ---

#[test]
fn save_load_roundtrip_preserves_data() {
    let tmp = tempfile::tempdir().unwrap();
    let csv_path = tmp.path().join("photos.csv");
    let path_str = csv_path.to_str().unwrap();
    let vectors = tmp.path().join("vectors.bin");

    let taken = Utc.with_ymd_and_hms(2023, 7, 14, 9, 30, 0).unwrap();
    {
        let mgr = photos::BackendCsv::load(path_str, vectors.clone()).unwrap();
        mgr.create(PhotoCreate {
            path: "/camera/2023/beach.jpg".into(),
            title: Some("Beach day".into()),
            description: Some("low tide at dusk".into()),
            tags: Some(vec!["beach".into(), "family".into()]),
            taken_at: Some(taken),
        })
        .unwrap();
        mgr.create(PhotoCreate {
            path: "/camera/misc.jpg".into(),
            ..Default::default()
        })
        .unwrap();
    }

    // reload from disk
    let mgr = photos::BackendCsv::load(path_str, vectors).unwrap();
    let all = mgr.all().unwrap();
    assert_eq!(all.len(), 2);

    let a = &all[0];
    assert_eq!(a.path, "/camera/2023/beach.jpg");
    assert_eq!(a.file_name, "beach.jpg");
    assert_eq!(a.title, "Beach day");
    assert_eq!(a.description, "low tide at dusk");
    assert_eq!(a.tags, vec!["beach", "family"]);
    assert_eq!(a.taken_at, Some(taken));
    assert!(!a.uuid.to_string().is_empty());

    let b = &all[1];
    assert_eq!(b.file_name, "misc.jpg");
    assert!(b.title.is_empty());
    assert!(b.tags.is_empty());
    assert!(b.taken_at.is_none());
}

#[test]
fn load_nonexistent_creates_empty_csv() {
    let tmp = tempfile::tempdir().unwrap();
    let csv_path = tmp.path().join("new.csv");
    let mgr = photos::BackendCsv::load(csv_path.to_str().unwrap(), tmp.path().join("vectors.bin"))
        .unwrap();
    assert_eq!(mgr.all().unwrap().len(), 0);
    assert!(csv_path.exists());
}

#[test]
fn tags_lowercased_on_reload() {
    let tmp = tempfile::tempdir().unwrap();
    let csv_path = tmp.path().join("photos.csv");
    let path_str = csv_path.to_str().unwrap();
    let vectors = tmp.path().join("vectors.bin");

    {
        let mgr = photos::BackendCsv::load(path_str, vectors.clone()).unwrap();
        let photo = mgr
            .create(PhotoCreate {
                path: "/camera/trip.jpg".into(),
                tags: Some(vec!["Family".into(), "Trip".into()]),
                ..Default::default()
            })
            .unwrap();
        // Case survives in memory until the next load normalizes it
        assert_eq!(photo.tags, vec!["Family", "Trip"]);
    }

    let mgr = photos::BackendCsv::load(path_str, vectors).unwrap();
    assert_eq!(mgr.all().unwrap()[0].tags, vec!["family", "trip"]);
}

#[test]
fn tags_containing_spaces_roundtrip_corruption() {
    let tmp = tempfile::tempdir().unwrap();
    let csv_path = tmp.path().join("photos.csv");
    let path_str = csv_path.to_str().unwrap();
    let vectors = tmp.path().join("vectors.bin");

    {
        let mgr = photos::BackendCsv::load(path_str, vectors.clone()).unwrap();
        mgr.create(PhotoCreate {
            path: "/camera/ny.jpg".into(),
            tags: Some(vec!["new york".into(), "city".into()]),
            ..Default::default()
        })
        .unwrap();
    }

    // Known corruption: the tag cell is split on whitespace as well as
    // commas, so "new york" comes back as two tags
    let mgr = photos::BackendCsv::load(path_str, vectors).unwrap();
    assert_eq!(mgr.all().unwrap()[0].tags, vec!["new", "york", "city"]);
}

#[test]
fn csv_fields_with_embedded_quotes_and_newlines() {
    let tmp = tempfile::tempdir().unwrap();
    let csv_path = tmp.path().join("photos.csv");
    let path_str = csv_path.to_str().unwrap();
    let vectors = tmp.path().join("vectors.bin");

    let title = "Dinner \"at home\"";
    let description = "first line\nsecond line";
    {
        let mgr = photos::BackendCsv::load(path_str, vectors.clone()).unwrap();
        mgr.create(PhotoCreate {
            path: "/camera/dinner.jpg".into(),
            title: Some(title.into()),
            description: Some(description.into()),
            ..Default::default()
        })
        .unwrap();
    }

    let mgr = photos::BackendCsv::load(path_str, vectors).unwrap();
    let photo = &mgr.all().unwrap()[0];
    assert_eq!(photo.title, title);
    assert_eq!(photo.description, description);
}

// --- create ---

#[test]
fn create_assigns_sequential_ids() {
    let (mgr, _tmp) = fresh_photos();
    let p0 = mgr.create(PhotoCreate { path: "/camera/a.jpg".into(), ..Default::default() }).unwrap();
    let p1 = mgr.create(PhotoCreate { path: "/camera/b.jpg".into(), ..Default::default() }).unwrap();
    assert_eq!(p0.id, 0);
    assert_eq!(p1.id, 1);
    assert_ne!(p0.uuid, p1.uuid);
}

#[test]
fn get_by_uuid_finds_photo() {
    let (mgr, _tmp) = fresh_photos();
    let created = mgr
        .create(PhotoCreate { path: "/camera/a.jpg".into(), ..Default::default() })
        .unwrap();

    let found = mgr.get_by_uuid(created.uuid.as_str()).unwrap().unwrap();
    assert_eq!(found.id, created.id);
    assert!(mgr.get_by_uuid("01JUNKULID").unwrap().is_none());
}

#[test]
fn create_derives_file_name_from_path() {
    let (mgr, _tmp) = fresh_photos();
    let photo = mgr
        .create(PhotoCreate {
            path: "/camera/2023/07/IMG_1234.jpg".into(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(photo.file_name, "IMG_1234.jpg");
}

#[test]
fn create_deduplicates_tags() {
    let (mgr, _tmp) = fresh_photos();
    let photo = mgr
        .create(PhotoCreate {
            path: "/camera/a.jpg".into(),
            tags: Some(vec!["a".into(), "b".into(), "a".into(), "c".into(), "b".into()]),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(photo.tags, vec!["a", "b", "c"]);
}

#[test]
fn create_defaults_empty_fields() {
    let (mgr, _tmp) = fresh_photos();
    let photo = mgr
        .create(PhotoCreate {
            path: "/camera/bare.jpg".into(),
            ..Default::default()
        })
        .unwrap();
    assert!(photo.title.is_empty());
    assert!(photo.description.is_empty());
    assert!(photo.tags.is_empty());
    assert!(photo.taken_at.is_none());
}

// --- update ---

#[test]
fn update_modifies_fields_selectively() {
    let (mgr, _tmp) = fresh_photos();
    seed(&mgr, 2);

    let updated = mgr
        .update(1, PhotoUpdate { title: Some("Renamed".into()), ..Default::default() })
        .unwrap();
    assert_eq!(updated.title, "Renamed");
    assert_eq!(updated.description, "Description 1");
    assert_eq!(updated.tags, vec!["all", "tag1"]);

    // The other photo is untouched
    assert_eq!(mgr.get(0).unwrap().unwrap().title, "Title 0");
}

#[test]
fn update_sets_taken_at() {
    let (mgr, _tmp) = fresh_photos();
    seed(&mgr, 1);
    assert!(mgr.get(0).unwrap().unwrap().taken_at.is_none());

    let taken = Utc.with_ymd_and_hms(2021, 12, 24, 18, 0, 0).unwrap();
    let updated = mgr
        .update(0, PhotoUpdate { taken_at: Some(taken), ..Default::default() })
        .unwrap();
    assert_eq!(updated.taken_at, Some(taken));
}

#[test]
fn update_append_tags_deduplicates() {
    let (mgr, _tmp) = fresh_photos();
    seed(&mgr, 1);

    let updated = mgr
        .update(
            0,
            PhotoUpdate {
                append_tags: Some(vec!["all".into(), "new".into()]),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.tags, vec!["all", "tag0", "new"]);
}

#[test]
fn update_remove_tags() {
    let (mgr, _tmp) = fresh_photos();
    seed(&mgr, 1);

    let updated = mgr
        .update(
            0,
            PhotoUpdate {
                remove_tags: Some(vec!["all".into()]),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.tags, vec!["tag0"]);
}

#[test]
fn update_nonexistent_returns_error() {
    let (mgr, _tmp) = fresh_photos();
    seed(&mgr, 1);
    assert!(mgr
        .update(99, PhotoUpdate { title: Some("X".into()), ..Default::default() })
        .is_err());
}

// --- delete ---

#[test]
fn delete_removes_photo() {
    let (mgr, _tmp) = fresh_photos();
    seed(&mgr, 3);

    mgr.delete(1).unwrap();
    assert_eq!(mgr.all().unwrap().len(), 2);
    assert!(mgr.get(1).unwrap().is_none());
}

#[test]
fn delete_nonexistent_is_noop() {
    let (mgr, _tmp) = fresh_photos();
    seed(&mgr, 2);
    mgr.delete(99).unwrap();
    assert_eq!(mgr.all().unwrap().len(), 2);
}

// --- unprocessed ---

#[test]
fn unprocessed_requires_describable_content() {
    let mgr = photos::BackendCsv::load("test-photos.csv", PathBuf::from("test-vectors.bin"))
        .unwrap()
        .wipe_database();

    mgr.create(PhotoCreate {
        path: "/camera/raw/DSC0001.jpg".to_string(),
        ..Default::default()
    })
    .unwrap();
    let captioned = mgr
        .create(PhotoCreate {
            path: "/camera/raw/DSC0002.jpg".to_string(),
            title: Some("First day of school".to_string()),
            ..Default::default()
        })
        .unwrap();

    // Without a vector store every captioned photo needs an embedding;
    // photos with no describable text are never eligible
    let missing = mgr.unprocessed(&[0u8; 32]).unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].id, captioned.id);
}

// --- persons ---

#[test]
fn persons_roundtrip_preserves_aliases() {
    let tmp = tempfile::tempdir().unwrap();
    let persons_path = tmp.path().join("persons.csv");
    let faces_path = tmp.path().join("faces.csv");

    {
        let mgr = persons::BackendCsv::load(
            persons_path.to_str().unwrap(),
            faces_path.to_str().unwrap(),
        )
        .unwrap();
        mgr.create_person(PersonCreate {
            name: "李梅".into(),
            display_name: Some("Mom".into()),
            aliases: Some(vec!["mom".into(), "妈妈".into()]),
        })
        .unwrap();
    }

    let mgr = persons::BackendCsv::load(
        persons_path.to_str().unwrap(),
        faces_path.to_str().unwrap(),
    )
    .unwrap();
    let all = mgr.all_persons().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "李梅");
    assert_eq!(all[0].display_name, "Mom");
    assert_eq!(all[0].aliases, vec!["mom", "妈妈"]);
    assert_eq!(all[0].known_names(), vec!["李梅", "Mom", "mom", "妈妈"]);
}

#[test]
fn face_roundtrip_preserves_descriptor_and_bbox() {
    let tmp = tempfile::tempdir().unwrap();
    let persons_path = tmp.path().join("persons.csv");
    let faces_path = tmp.path().join("faces.csv");

    {
        let mgr = persons::BackendCsv::load(
            persons_path.to_str().unwrap(),
            faces_path.to_str().unwrap(),
        )
        .unwrap();
        let face = mgr
            .create_face(FaceCreate {
                photo_id: 7,
                confidence: 0.93,
                bbox: Some(BoundingBox { x: 10.0, y: 20.5, width: 64.0, height: 64.5 }),
                descriptor: Some(vec![0.25, -0.5, 1.0]),
            })
            .unwrap();
        assert_eq!(face.id, 0);
    }

    let mgr = persons::BackendCsv::load(
        persons_path.to_str().unwrap(),
        faces_path.to_str().unwrap(),
    )
    .unwrap();
    let face = mgr.get_face(0).unwrap().unwrap();
    assert_eq!(face.photo_id, 7);
    assert_eq!(face.confidence, 0.93);
    assert_eq!(
        face.bbox,
        Some(BoundingBox { x: 10.0, y: 20.5, width: 64.0, height: 64.5 })
    );
    assert_eq!(face.descriptor, Some(vec![0.25, -0.5, 1.0]));
    assert!(face.person_id.is_none());
    assert!(!face.manual);
    assert!(!face.processed);
}

#[test]
fn assign_face_requires_existing_person() {
    let (mgr, _tmp) = fresh_persons();
    let face = mgr
        .create_face(FaceCreate { photo_id: 1, ..Default::default() })
        .unwrap();

    assert!(mgr.assign_face(face.id, 42).is_err());

    let person = mgr
        .create_person(PersonCreate { name: "Ana".into(), ..Default::default() })
        .unwrap();
    let assigned = mgr.assign_face(face.id, person.id).unwrap();
    assert_eq!(assigned.person_id, Some(person.id));
    assert!(assigned.processed);

    let released = mgr.unassign_face(face.id).unwrap();
    assert!(released.person_id.is_none());
    assert!(!released.processed);
}

#[test]
fn tag_photo_is_idempotent() {
    let mgr = persons::BackendCsv::load("test-persons.csv", "test-faces.csv")
        .unwrap()
        .wipe_database();
    let person = mgr
        .create_person(PersonCreate { name: "Ana".into(), ..Default::default() })
        .unwrap();

    let first = mgr.tag_photo(person.id, 5).unwrap();
    let second = mgr.tag_photo(person.id, 5).unwrap();
    assert_eq!(first.id, second.id);
    assert!(first.manual);
    assert_eq!(mgr.all_faces().unwrap().len(), 1);
    assert_eq!(mgr.photo_ids_for_person(person.id).unwrap(), vec![5]);
}

#[test]
fn delete_person_releases_faces() {
    let (mgr, _tmp) = fresh_persons();
    let person = mgr
        .create_person(PersonCreate { name: "Ana".into(), ..Default::default() })
        .unwrap();
    let detected = mgr
        .create_face(FaceCreate {
            photo_id: 1,
            descriptor: Some(vec![1.0, 0.0]),
            ..Default::default()
        })
        .unwrap();
    mgr.assign_face(detected.id, person.id).unwrap();
    mgr.tag_photo(person.id, 9).unwrap();

    mgr.delete_person(person.id).unwrap();

    assert!(mgr.get_person(person.id).unwrap().is_none());
    // The manual tag disappears with its person, the detected face stays
    // behind and is eligible for matching again
    let faces = mgr.all_faces().unwrap();
    assert_eq!(faces.len(), 1);
    assert_eq!(faces[0].id, detected.id);
    assert!(faces[0].person_id.is_none());
    assert!(!faces[0].processed);
}

#[test]
fn photo_ids_for_person_dedupes() {
    let (mgr, _tmp) = fresh_persons();
    let person = mgr
        .create_person(PersonCreate { name: "Ana".into(), ..Default::default() })
        .unwrap();

    mgr.tag_photo(person.id, 5).unwrap();
    mgr.tag_photo(person.id, 9).unwrap();
    // A detected face in an already tagged photo adds no new id
    let face = mgr
        .create_face(FaceCreate { photo_id: 5, ..Default::default() })
        .unwrap();
    mgr.assign_face(face.id, person.id).unwrap();

    assert_eq!(mgr.photo_ids_for_person(person.id).unwrap(), vec![5, 9]);
}
