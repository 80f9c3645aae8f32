mod common;

use common::{dark_jpeg, face_jpeg, Harness};
use facegate::common::Config;
use facegate::core::{hash_password, AuthError, FaceTemplateStore};
use facegate::storage::{FaceArtifactKind, UserStore};
use std::fs;

#[test]
fn register_creates_user_template_and_enrollment_image() {
    let h = Harness::new();

    let outcome = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap();
    assert!(outcome.user_id > 0);
    assert_eq!(outcome.extra().get("user_id"), Some(&outcome.user_id.to_string()));

    let user = h.users.get_by_username("alice").unwrap().unwrap();
    assert_eq!(user.password_hash, hash_password("secret"));
    assert_eq!(user.registration_face_path, Some(h.paths.default_registration_face("alice")));
    assert!(h.paths.default_registration_face("alice").exists());
    assert_eq!(h.templates.sample_count(outcome.user_id), 1);
}

#[test]
fn duplicate_registration_is_rejected() {
    let h = Harness::new();
    let first = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap();

    let err = h.engine.register("alice", "other", &face_jpeg(2)).unwrap_err();
    assert_eq!(err, AuthError::DuplicateUser("alice".to_string()));

    let user = h.users.get_by_username("alice").unwrap().unwrap();
    assert_eq!(user.id, first.user_id);
    assert_eq!(user.password_hash, hash_password("secret"));
    assert_eq!(h.templates.user_count(), 1);
}

#[test]
fn register_requires_every_field_and_a_face() {
    let h = Harness::new();
    assert!(matches!(h.engine.register("", "pw", &face_jpeg(1)), Err(AuthError::Validation(_))));
    assert!(matches!(h.engine.register("bob", "", &face_jpeg(1)), Err(AuthError::Validation(_))));
    assert!(matches!(h.engine.register("bob", "pw", &[]), Err(AuthError::Validation(_))));
    assert!(matches!(h.engine.register("bob", "pw", b"not an image"), Err(AuthError::InvalidImage(_))));
    assert_eq!(h.engine.register("bob", "pw", &dark_jpeg()), Err(AuthError::NoFaceDetected));
    assert!(h.users.get_by_username("bob").unwrap().is_none());
}

#[test]
fn same_face_authenticates() {
    let h = Harness::new();
    let face = face_jpeg(1);
    let id = h.engine.register("alice", "secret", &face).unwrap().user_id;

    let outcome = h.engine.authenticate("alice", "secret", &face).unwrap();
    let distance = outcome.distance.unwrap();
    assert!(distance < 70.0, "distance {}", distance);
    assert_eq!(outcome.extra().get("face_verified").map(String::as_str), Some("true"));

    let user = h.users.get_by_id(id).unwrap().unwrap();
    assert!(user.last_login_at.is_some());

    let audit = h.users.audit_log(id).unwrap();
    assert_eq!(audit.len(), 1);
    assert!(audit[0].success);
}

#[test]
fn wrong_password_never_reaches_the_detector() {
    let h = Harness::new();
    let id = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap().user_id;
    let calls = h.detector_calls();

    let err = h.engine.authenticate("alice", "wrong", &dark_jpeg()).unwrap_err();
    assert_eq!(err, AuthError::InvalidCredentials);
    assert_eq!(err.to_string(), "Invalid password");
    assert_eq!(h.detector_calls(), calls);

    let audit = h.users.audit_log(id).unwrap();
    assert_eq!(audit.len(), 1);
    assert!(!audit[0].success);
    assert_eq!(audit[0].details, "password verification failed");
}

#[test]
fn login_without_face_is_rejected_and_audited() {
    let h = Harness::new();
    let id = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap().user_id;

    let err = h.engine.authenticate("alice", "secret", &dark_jpeg()).unwrap_err();
    assert_eq!(err, AuthError::NoFaceDetected);

    let audit = h.users.audit_log(id).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].details, "no face detected");
}

#[test]
fn unknown_user_is_not_found() {
    let h = Harness::new();
    assert_eq!(
        h.engine.authenticate("nobody", "pw", &face_jpeg(1)),
        Err(AuthError::UserNotFound)
    );
}

#[test]
fn distance_at_or_above_threshold_is_a_mismatch() {
    let mut config = Config::default();
    config.auth.face_distance_threshold = 0.001;
    let h = Harness::with_config(config);
    let id = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap().user_id;

    let err = h.engine.authenticate("alice", "secret", &face_jpeg(7)).unwrap_err();
    match &err {
        AuthError::FaceMismatch { distance } => assert!(*distance >= 0.001),
        other => panic!("expected mismatch, got {:?}", other),
    }
    assert_eq!(err.extra().get("face_verified").map(String::as_str), Some("false"));

    let user = h.users.get_by_id(id).unwrap().unwrap();
    assert!(user.last_login_at.is_none());
    let audit = h.users.audit_log(id).unwrap();
    assert!(audit[0].details.starts_with("face verification failed, confidence="));
}

#[test]
fn missing_enrollment_image_is_reported() {
    let h = Harness::new();
    let id = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap().user_id;
    fs::remove_file(h.paths.default_registration_face("alice")).unwrap();

    assert_eq!(
        h.engine.authenticate("alice", "secret", &face_jpeg(1)),
        Err(AuthError::MissingEnrollment)
    );
    assert_eq!(h.users.audit_log(id).unwrap()[0].details, "no enrollment face");
}

#[test]
fn first_login_bootstraps_missing_template_once() {
    let h = Harness::new();
    let face = face_jpeg(3);

    // Account created without training, as after a failed registration-time train
    let id = h.users.create_user("carol", &hash_password("pw")).unwrap();
    let path = h.users.save_face_artifact(id, &face, FaceArtifactKind::Register).unwrap();
    h.users.set_registration_face(id, &path).unwrap();
    assert!(!h.templates.has_samples(id));

    h.engine.authenticate("carol", "pw", &face).unwrap();
    assert_eq!(h.templates.sample_count(id), 1);

    h.engine.authenticate("carol", "pw", &face).unwrap();
    assert_eq!(h.templates.sample_count(id), 1);
}

#[test]
fn update_face_appends_a_sample() {
    let h = Harness::new();
    let id = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap().user_id;
    let before = h.users.get_by_id(id).unwrap().unwrap().registration_face_path;

    h.engine.update_face(id, &face_jpeg(2)).unwrap();
    assert_eq!(h.templates.sample_count(id), 2);

    let after = h.users.get_by_id(id).unwrap().unwrap().registration_face_path;
    assert_ne!(before, after);
    assert!(after.unwrap().exists());

    // The new enrollment image is the one logins are checked against
    assert!(h.engine.authenticate("alice", "secret", &face_jpeg(2)).is_ok());
}

#[test]
fn update_face_validates_input() {
    let h = Harness::new();
    let id = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap().user_id;

    assert!(matches!(h.engine.update_face(0, &face_jpeg(2)), Err(AuthError::Validation(_))));
    assert!(matches!(h.engine.update_face(-4, &face_jpeg(2)), Err(AuthError::Validation(_))));
    assert!(matches!(h.engine.update_face(id, &[]), Err(AuthError::Validation(_))));
    assert_eq!(h.engine.update_face(id + 100, &face_jpeg(2)), Err(AuthError::UserNotFound));
    assert_eq!(h.engine.update_face(id, &dark_jpeg()), Err(AuthError::NoFaceDetected));
    assert_eq!(h.templates.sample_count(id), 1);
}

#[test]
fn compare_leaves_the_store_untouched() {
    let h = Harness::new();
    let id = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap().user_id;
    h.engine.register("bob", "secret", &face_jpeg(5)).unwrap();

    let archive = h.paths.models_dir().join("training_data.dat");
    let archive_before = fs::read(&archive).unwrap();
    let probe = h.templates.samples(id).remove(0);
    let prediction_before = h.templates.recognize_sample(&probe).unwrap();

    let other = h.vision.preprocess(&image::load_from_memory(&face_jpeg(9)).unwrap()).unwrap();
    for _ in 0..3 {
        h.templates.compare(&other, &probe).unwrap();
    }

    assert_eq!(h.templates.recognize_sample(&probe).unwrap(), prediction_before);
    assert_eq!(prediction_before.label, id);
    assert_eq!(fs::read(&archive).unwrap(), archive_before);
    assert_eq!(h.templates.user_count(), 2);
}

#[test]
fn compare_of_a_sample_with_itself_is_under_threshold() {
    let h = Harness::new();
    let sample = h.vision.preprocess(&image::load_from_memory(&face_jpeg(4)).unwrap()).unwrap();
    assert!(h.templates.compare(&sample, &sample).unwrap() < 70.0);
}

#[test]
fn templates_survive_reopen() {
    let h = Harness::new();
    let alice = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap().user_id;
    let bob = h.engine.register("bob", "secret", &face_jpeg(5)).unwrap().user_id;
    h.engine.update_face(alice, &face_jpeg(2)).unwrap();

    let reopened: FaceTemplateStore = h.reopen_templates();
    assert_eq!(reopened.samples(alice), h.templates.samples(alice));
    assert_eq!(reopened.samples(bob), h.templates.samples(bob));

    for probe in h.templates.samples(alice).iter().chain(h.templates.samples(bob).iter()) {
        assert_eq!(
            reopened.recognize_sample(probe).unwrap(),
            h.templates.recognize_sample(probe).unwrap()
        );
    }
}

#[test]
fn untrained_store_recognizes_nobody() {
    let h = Harness::new();
    let region = image::load_from_memory(&face_jpeg(1)).unwrap();
    let prediction = h.templates.recognize(&region).unwrap();
    assert_eq!(prediction.label, -1);
    assert_eq!(prediction.distance, facegate::core::MAX_DISTANCE);
}

#[test]
fn path_like_usernames_are_refused_before_anything_is_written() {
    let h = Harness::new();
    for name in ["../../escaped", "a/b", "..\\evil"] {
        assert!(matches!(
            h.engine.register(name, "pw", &face_jpeg(1)),
            Err(AuthError::Validation(_))
        ));
        assert!(h.users.get_by_username(name).unwrap().is_none());
    }
    assert!(!h.dir.path().join("escaped_register.jpg").exists());
    assert_eq!(fs::read_dir(h.paths.faces_dir()).unwrap().count(), 0);
}

#[test]
fn failed_enrollment_write_leaves_no_account_behind() {
    let h = Harness::new();
    // A plain file where the faces directory should be makes the image write fail
    fs::remove_dir(h.paths.faces_dir()).unwrap();
    fs::write(h.paths.faces_dir(), b"").unwrap();

    assert!(matches!(
        h.engine.register("alice", "secret", &face_jpeg(1)),
        Err(AuthError::Storage(_))
    ));
    assert!(h.users.get_by_username("alice").unwrap().is_none());
    assert_eq!(h.templates.user_count(), 0);

    fs::remove_file(h.paths.faces_dir()).unwrap();
    fs::create_dir(h.paths.faces_dir()).unwrap();

    let id = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap().user_id;
    assert!(h.engine.authenticate("alice", "secret", &face_jpeg(1)).is_ok());
    assert_eq!(h.users.get_by_username("alice").unwrap().unwrap().id, id);
}

#[test]
fn failed_template_write_keeps_memory_and_disk_in_step() {
    let h = Harness::new();
    let id = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap().user_id;
    let enrolled = h.users.get_by_id(id).unwrap().unwrap().registration_face_path;

    // A directory in the staging file's place makes the archive write fail
    let staging = h.paths.models_dir().join("training_data.tmp");
    fs::create_dir(&staging).unwrap();

    assert!(matches!(h.engine.update_face(id, &face_jpeg(2)), Err(AuthError::Storage(_))));
    assert_eq!(h.templates.sample_count(id), 1);
    assert_eq!(h.reopen_templates().sample_count(id), 1);
    assert_eq!(h.users.get_by_id(id).unwrap().unwrap().registration_face_path, enrolled);

    fs::remove_dir(&staging).unwrap();
    h.engine.update_face(id, &face_jpeg(2)).unwrap();
    assert_eq!(h.templates.sample_count(id), 2);
    assert_eq!(h.reopen_templates().sample_count(id), 2);
}

#[test]
fn user_database_size_is_flat_across_logins() {
    let h = Harness::new();
    let id = h.engine.register("alice", "secret", &face_jpeg(1)).unwrap().user_id;
    h.engine.authenticate("alice", "secret", &face_jpeg(1)).unwrap();

    let db_file = h.paths.users_dir().join("users.bincode");
    let size = fs::metadata(&db_file).unwrap().len();
    for _ in 0..5 {
        h.engine.authenticate("alice", "secret", &face_jpeg(1)).unwrap();
        h.engine.authenticate("alice", "wrong", &face_jpeg(1)).unwrap_err();
    }

    // Timestamps serialise with a variable number of fractional digits
    let after = fs::metadata(&db_file).unwrap().len();
    assert!(after <= size + 16, "grew from {} to {} bytes", size, after);
    assert_eq!(h.users.audit_log(id).unwrap().len(), 11);
}
