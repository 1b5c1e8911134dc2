//! Save/open round-trips against an on-disk `oci-layout` directory, plus a rebase
//! exercised across two such round-trips.

use std::io::Read;

use imgutil::backend::layout::LayoutBackend;
use imgutil::backend::{Backend, SaveOptions};
use imgutil::cancel::Cancellation;
use imgutil::digest::Digest;
use imgutil::image::Image;
use imgutil::layer::{Layer, MediaType};
use imgutil::rebase::{self, NewBase};

fn write_tar(dir: &std::path::Path, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).expect("create");
    let mut builder = tar::Builder::new(file);
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "f", content).expect("append");
    builder.finish().expect("finish");
    path
}

#[tokio::test]
async fn save_mutate_reopen_round_trip() {
    let scratch = tempfile::tempdir().expect("scratch");
    let layout_root = tempfile::tempdir().expect("layout root");
    let backend = LayoutBackend::new(layout_root.path());

    let base_layer = write_tar(scratch.path(), "base.tar", b"base-bytes");

    let mut image = Image::empty();
    image.set_os("linux").expect("set os");
    image.set_architecture("amd64");
    image.add_layer(&base_layer).expect("add layer");
    image.set_label("org.example.stage", "base");

    backend
        .save(&image, "app:v1", SaveOptions::default(), &Cancellation::none())
        .await
        .expect("save v1");

    let reopened = backend.open("app:v1", &Cancellation::none()).await.expect("open v1");
    assert!(reopened.found());
    assert_eq!(reopened.layers().len(), 1);
    assert_eq!(reopened.config().labels.get("org.example.stage").map(String::as_str), Some("base"));

    let mut reader = reopened.get_layer(&reopened.layers()[0].diff_id).await.expect("get layer");
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).expect("read");
    let mut archive = tar::Archive::new(&bytes[..]);
    let mut entry = archive.entries().expect("entries").next().expect("one entry").expect("entry");
    let mut content = Vec::new();
    entry.read_to_end(&mut content).expect("read entry");
    assert_eq!(content, b"base-bytes");

    // Mutate the reopened core and save it under a second name; the first name's saved
    // artifact must be untouched.
    let mut mutated = reopened;
    let extra_layer = write_tar(scratch.path(), "extra.tar", b"extra-bytes");
    mutated.add_layer(&extra_layer).expect("add second layer");
    mutated.set_label("org.example.stage", "mutated");

    backend
        .save(&mutated, "app:v2", SaveOptions::default(), &Cancellation::none())
        .await
        .expect("save v2");

    let v1_again = backend.open("app:v1", &Cancellation::none()).await.expect("reopen v1");
    assert_eq!(v1_again.layers().len(), 1);
    assert_eq!(v1_again.config().labels.get("org.example.stage").map(String::as_str), Some("base"));

    let v2 = backend.open("app:v2", &Cancellation::none()).await.expect("open v2");
    assert_eq!(v2.layers().len(), 2);
    assert_eq!(v2.config().labels.get("org.example.stage").map(String::as_str), Some("mutated"));
}

#[tokio::test]
async fn rebase_swaps_shared_seam_and_round_trips() {
    let scratch = tempfile::tempdir().expect("scratch");
    let layout_root = tempfile::tempdir().expect("layout root");
    let backend = LayoutBackend::new(layout_root.path());

    let old_base_layer = write_tar(scratch.path(), "old-base.tar", b"old-base");
    let app_layer = write_tar(scratch.path(), "app.tar", b"app-bytes");

    let mut image = Image::empty();
    image.set_os("linux").expect("set os");
    image.set_architecture("amd64");
    image.add_layer(&old_base_layer).expect("add old base layer");
    let old_base_top = image.layers()[0].diff_id.clone();
    image.add_layer(&app_layer).expect("add app layer");

    backend
        .save(&image, "app:rebasing", SaveOptions::default(), &Cancellation::none())
        .await
        .expect("save");

    let mut reopened = backend.open("app:rebasing", &Cancellation::none()).await.expect("open");

    let new_base_layer_path = write_tar(scratch.path(), "new-base.tar", b"new-base");
    let new_base_diff_id =
        Digest::sha256_reader(std::fs::File::open(&new_base_layer_path).expect("open")).expect("hash");
    let new_base = NewBase {
        layers: vec![Layer {
            diff_id: new_base_diff_id.clone(),
            digest: None,
            media_type: MediaType::OciLayer,
            size: -1,
            path: Some(new_base_layer_path.clone()),
            source: imgutil::layer::LayerSource::OnDisk(new_base_layer_path),
        }],
        history: vec![Default::default()],
        os: "linux".to_owned(),
        architecture: "arm64".to_owned(),
        variant: None,
        os_version: None,
        os_features: None,
    };

    rebase::rebase(&mut reopened, &old_base_top, new_base).expect("rebase");
    assert_eq!(reopened.layers().len(), 2);
    assert_eq!(reopened.layers()[0].diff_id, new_base_diff_id);
    assert_eq!(reopened.layers()[1].diff_id.to_string(), {
        let mut f = std::fs::File::open(&app_layer).expect("open");
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).expect("read");
        Digest::sha256(&buf).to_string()
    });

    backend
        .save(&reopened, "app:rebased", SaveOptions::default(), &Cancellation::none())
        .await
        .expect("save rebased");

    let final_image = backend.open("app:rebased", &Cancellation::none()).await.expect("open rebased");
    assert_eq!(final_image.config().architecture, "arm64");
    assert_eq!(final_image.layers().len(), 2);
}
