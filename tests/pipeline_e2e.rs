use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pbr_map_forge::{
    client::{GenerationClient, HttpResponse, HttpTransport},
    data_url::encode_data_url,
    dsl::{load_document_from_path, save_document_to_path},
    error::{ErrorClass, PipelineResult},
    graph::GraphQuery,
    orchestrator::{MaterialKey, NoProgress, Orchestrator},
    protocol::MapKind,
    schema::validate_document,
    settings::{GenerationSettings, InMemoryCredentialStore},
};

/// Replays one canned response and records every request body.
struct FakeService {
    status: u16,
    body: String,
    requests: Mutex<Vec<serde_json::Value>>,
}

impl FakeService {
    fn new(status: u16, body: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            status,
            body: body.into(),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl HttpTransport for FakeService {
    fn post_json(
        &self,
        _url: &str,
        _api_key: &str,
        body: String,
        _timeout: Duration,
    ) -> PipelineResult<HttpResponse> {
        let json = serde_json::from_str(&body).expect("request body is JSON");
        self.requests.lock().unwrap().push(json);
        Ok(HttpResponse {
            status: self.status,
            body: self.body.clone(),
        })
    }
}

fn png(rgb: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(8, 8, image::Rgb(rgb));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

/// A saved material whose base color comes from `//base.png` through a Gamma node.
fn write_fixture(dir: &Path) -> PathBuf {
    std::fs::write(dir.join("base.png"), png([180, 120, 60])).unwrap();
    let doc = serde_json::json!({
        "version": "1.0",
        "metadata": {"name": "Wood", "objectId": "Cube", "materialId": "Wood"},
        "nodes": [
            {"id": "out", "type": "MaterialOutput"},
            {"id": "bsdf", "type": "PrincipledBsdf"},
            {"id": "gamma", "type": "Gamma"},
            {"id": "tex", "type": "ImageTexture", "params": {"image": "base"}}
        ],
        "connections": [
            {"id": "c1", "from": {"nodeId": "bsdf", "portId": "BSDF"},
             "to": {"nodeId": "out", "portId": "Surface"}},
            {"id": "c2", "from": {"nodeId": "gamma", "portId": "Color"},
             "to": {"nodeId": "bsdf", "portId": "Base Color"}},
            {"id": "c3", "from": {"nodeId": "tex", "portId": "Color"},
             "to": {"nodeId": "gamma", "portId": "Color"}}
        ],
        "images": {"base": {"name": "base.png", "filepath": "//base.png"}}
    });
    let path = dir.join("material.json");
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    path
}

fn orchestrator(service: &Arc<FakeService>) -> Orchestrator {
    Orchestrator::new(GenerationClient::new(service.clone())).unwrap()
}

fn key() -> MaterialKey {
    MaterialKey::new("Cube", "Wood")
}

#[test]
fn normal_only_response_rebuilds_material() {
    let dir = tempfile::tempdir().unwrap();
    let doc_path = write_fixture(dir.path());
    let mut doc = load_document_from_path(&doc_path).unwrap();
    validate_document(&doc).unwrap();

    let service = FakeService::new(
        200,
        serde_json::json!({
            "success": true,
            "textures": {"normal": encode_data_url("image/png", &png([128, 128, 255]))},
            "usage": {"remaining": 41}
        })
        .to_string(),
    );
    let orch = orchestrator(&service);
    let mut settings = GenerationSettings::default();
    let creds = InMemoryCredentialStore::with_key("test-key");

    let report = orch
        .run(&key(), &mut doc, &mut settings, &creds, &NoProgress)
        .unwrap();

    // The source was detected through the graph and remembered.
    assert!(report.auto_resolved);
    assert_eq!(report.source, dir.path().join("base.png"));
    assert_eq!(settings.base_texture(), Some(dir.path().join("base.png")));
    assert!(!report.recompressed);
    assert_eq!(report.usage.unwrap()["remaining"], 41);

    let sent = service.requests.lock().unwrap()[0].clone();
    assert_eq!(
        sent["textureTypes"],
        serde_json::json!(["normal", "metallic", "roughness", "ao"])
    );
    assert!(sent["baseImage"].as_str().unwrap().starts_with("data:image/png;base64,"));

    assert_eq!(report.apply.applied, [MapKind::Normal].into_iter().collect());
    assert!(report.apply.albedo_bound);
    assert!(report.apply.warnings.is_empty());

    // Old nodes are gone; albedo feeds base color directly, normal goes through a NormalMap.
    assert!(doc.nodes.iter().all(|n| n.node_type != "Gamma"));
    let bsdf = doc.nodes.iter().find(|n| n.node_type == "PrincipledBsdf").unwrap();
    let base_src = doc.link_source(&bsdf.id, "Base Color").unwrap();
    assert_eq!(doc.node(&base_src).unwrap().label.as_deref(), Some("Albedo"));
    let normal_src = doc.link_source(&bsdf.id, "Normal").unwrap();
    assert_eq!(doc.node(&normal_src).unwrap().node_type, "NormalMap");
    assert!(doc.link_source(&bsdf.id, "Metallic").is_none());
    assert!(doc.link_source(&bsdf.id, "Roughness").is_none());
    validate_document(&doc).unwrap();

    // The rebuilt document survives a save/load cycle.
    let saved = dir.path().join("out.json");
    save_document_to_path(&doc, &saved).unwrap();
    let reloaded = load_document_from_path(&saved).unwrap();
    assert_eq!(reloaded.nodes.len(), doc.nodes.len());
    assert_eq!(reloaded.images.len(), doc.images.len());
}

#[test]
fn bad_request_leaves_graph_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = load_document_from_path(write_fixture(dir.path())).unwrap();
    let before = serde_json::to_value(&doc).unwrap();

    let service = FakeService::new(
        400,
        r#"{"error":"Bad Request","message":"Invalid image format"}"#,
    );
    let orch = orchestrator(&service);
    let err = orch
        .run(
            &key(),
            &mut doc,
            &mut GenerationSettings::default(),
            &InMemoryCredentialStore::with_key("k"),
            &NoProgress,
        )
        .unwrap_err();

    assert_eq!(err.class, ErrorClass::HttpBadRequest);
    assert_eq!(err.code, 400);
    assert_eq!(err.message, "Bad Request: Invalid image format");
    assert!(err.user_message().contains("Check the selected image"));
    assert_eq!(serde_json::to_value(&doc).unwrap(), before);
    assert!(!orch.is_in_flight(&key()));
}

#[test]
fn empty_selection_fails_without_network() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = load_document_from_path(write_fixture(dir.path())).unwrap();
    let service = FakeService::new(200, "{}");
    let mut settings = GenerationSettings::default();
    settings.set_selection(&Default::default());

    let err = orchestrator(&service)
        .run(
            &key(),
            &mut doc,
            &mut settings,
            &InMemoryCredentialStore::with_key("k"),
            &NoProgress,
        )
        .unwrap_err();
    assert_eq!((err.class, err.code), (ErrorClass::HttpBadRequest, 0));
    assert_eq!(service.request_count(), 0);
}

#[test]
fn concurrent_run_on_same_material_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = load_document_from_path(write_fixture(dir.path())).unwrap();
    let service = FakeService::new(200, r#"{"success":true,"textures":{}}"#);
    let orch = orchestrator(&service);
    let creds = InMemoryCredentialStore::with_key("k");
    let mut settings = GenerationSettings::default();

    let held = orch.plan(&key(), &doc, &mut settings, &creds).unwrap();
    let err = orch
        .run(&key(), &mut doc, &mut settings, &creds, &NoProgress)
        .unwrap_err();
    assert_eq!(err.class, ErrorClass::Busy);
    assert_eq!(service.request_count(), 0);

    drop(held);
    let report = orch
        .run(&key(), &mut doc, &mut settings, &creds, &NoProgress)
        .unwrap();
    assert!(report.apply.applied.is_empty());
    assert_eq!(service.request_count(), 1);
}

#[test]
fn missing_source_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = load_document_from_path(write_fixture(dir.path())).unwrap();
    std::fs::remove_file(dir.path().join("base.png")).unwrap();
    let service = FakeService::new(200, "{}");

    let err = orchestrator(&service)
        .run(
            &key(),
            &mut doc,
            &mut GenerationSettings::default(),
            &InMemoryCredentialStore::with_key("k"),
            &NoProgress,
        )
        .unwrap_err();
    assert_eq!(err.class, ErrorClass::NotFound);
    assert_eq!(service.request_count(), 0);
}
