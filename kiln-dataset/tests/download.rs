use kiln_dataset::download::Downloader;
use kiln_dataset::Summary;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn png_bytes() -> Vec<u8> {
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(6, 4, image::Rgb([200, 120, 40])))
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

async fn mount_image(server: &MockServer, name: &str) -> String {
    Mock::given(method("GET"))
        .and(path(format!("/assets/{name}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
        .mount(server)
        .await;
    format!("{}/assets/{name}", server.uri())
}

#[tokio::test]
async fn stores_rows_under_label_directories() {
    let server = MockServer::start().await;
    let first = mount_image(&server, "0.png").await;
    let second = mount_image(&server, "1.png").await;
    Mock::given(method("GET"))
        .and(path("/rows"))
        .and(query_param("dataset", "kiln/pots"))
        .and(query_param("config", "default"))
        .and(query_param("split", "train"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [
                {"row_idx": 0, "row": {"image": {"src": first}, "label": 2}},
                {"row_idx": 1, "row": {"image": {"src": second}, "label": "raku"}},
                {"row_idx": 2, "row": {"image": null}}
            ],
            "num_rows_total": 3
        })))
        .expect(1)
        .mount(&server)
        .await;
    let out = TempDir::new().unwrap();

    let summary = Downloader::new(&server.uri())
        .unwrap()
        .download("kiln/pots", "train", out.path(), None)
        .await
        .unwrap();

    assert_eq!(summary, Summary { processed: 2, failed: 1 });
    let saved = image::open(out.path().join("2/pottery_0.png")).unwrap();
    assert_eq!((saved.width(), saved.height()), (6, 4));
    assert!(out.path().join("raku/pottery_1.png").exists());
}

#[tokio::test]
async fn limit_caps_the_page_length() {
    let server = MockServer::start().await;
    let src = mount_image(&server, "0.png").await;
    Mock::given(method("GET"))
        .and(path("/rows"))
        .and(query_param("length", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [{"row_idx": 0, "row": {"image": {"src": src}, "label": 0}}],
            "num_rows_total": 500
        })))
        .expect(1)
        .mount(&server)
        .await;
    let out = TempDir::new().unwrap();

    let summary = Downloader::new(&server.uri())
        .unwrap()
        .download("kiln/pots", "train", out.path(), Some(1))
        .await
        .unwrap();

    assert_eq!(summary.processed, 1);
}

#[tokio::test]
async fn server_error_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rows"))
        .respond_with(ResponseTemplate::new(404).set_body_string("dataset not found"))
        .mount(&server)
        .await;
    let out = TempDir::new().unwrap();

    let err = Downloader::new(&server.uri())
        .unwrap()
        .download("missing/set", "train", out.path(), None)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("dataset not found"));
}
