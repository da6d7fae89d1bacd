//! Output rendering for `get-output` against a finished in-process run.

use bytes::Bytes;
use t2server_cli::cli::get_output::{render_outputs, RenderOptions};
use t2server_cli::model::{OutputPort, PortData, PortValue};
use t2server_cli::port::parse_coordinate;
use t2server_cli::server::memory::{MemoryRun, MemoryServer, Workflow};
use t2server_cli::server::{Run, Server};
use t2server_cli::Error;

fn text(s: &'static str) -> PortData {
    PortData::Value(PortValue::Inline {
        content_type: "text/plain".into(),
        data: Bytes::from_static(s.as_bytes()),
    })
}

/// `words` is `[[a, <ref b>], [ERROR]]`.
fn words() -> OutputPort {
    OutputPort {
        name: "words".into(),
        depth: 2,
        data: PortData::List(vec![
            PortData::List(vec![
                text("a"),
                PortData::Value(PortValue::Reference {
                    uri: "http://h/wd/b".into(),
                    content_type: "text/plain".into(),
                    size: 1,
                }),
            ]),
            PortData::List(vec![PortData::Value(PortValue::Error {
                message: "boom".into(),
            })]),
        ]),
    }
}

async fn finished_run() -> MemoryRun {
    let wf = Workflow::new()
        .output(words())
        .output(OutputPort {
            name: "count".into(),
            depth: 0,
            data: text("3"),
        })
        .reference("http://h/wd/b", "b")
        .polls_until_finished(0);
    let server = MemoryServer::new(wf);
    let run = server
        .create_run(Bytes::from_static(b"<wf/>"), None)
        .await
        .expect("create");
    run.start().await.expect("start");
    run.status().await.expect("status");
    run
}

#[tokio::test]
async fn lists_every_leaf_of_every_port() {
    let run = finished_run().await;
    let lines = render_outputs(&run, &[], RenderOptions::default())
        .await
        .expect("render");

    assert_eq!(lines[0], "words (depth 2) {");
    assert_eq!(lines[1], " Index:        0,0");
    assert_eq!(lines[2], " Reference:    (inline)");
    assert!(lines.contains(&" Reference:    http://h/wd/b".to_string()));
    assert!(lines.contains(&" Error:        boom".to_string()));
    assert!(lines.contains(&"count (depth 0) {".to_string()));
    assert_eq!(lines.iter().filter(|l| *l == "}").count(), 2);
    // Payloads are only printed on request.
    assert!(!lines.iter().any(|l| l == " Data: <<"));
}

#[tokio::test]
async fn refs_mode_prints_one_line_per_leaf() {
    let run = finished_run().await;
    let coords = vec![parse_coordinate("words").unwrap()];
    let opts = RenderOptions {
        refs: true,
        ..Default::default()
    };
    let lines = render_outputs(&run, &coords, opts).await.expect("render");
    assert_eq!(
        lines,
        vec![
            "words (depth 2) {",
            " 0,0 -> (inline)",
            " 0,1 -> http://h/wd/b",
            " 1,0 -> ERROR: boom",
            "}",
        ]
    );
}

#[tokio::test]
async fn data_mode_fetches_referenced_payloads() {
    let run = finished_run().await;
    let coords = vec![parse_coordinate("words:0,1").unwrap()];
    let opts = RenderOptions {
        data: true,
        ..Default::default()
    };
    let lines = render_outputs(&run, &coords, opts).await.expect("render");
    let at = lines.iter().position(|l| l == " Data: <<").expect("data block");
    assert_eq!(lines[at + 1], "b");
    assert_eq!(lines[at + 2], ">>");
}

#[tokio::test]
async fn data_mode_skips_error_leaves() {
    let run = finished_run().await;
    let coords = vec![parse_coordinate("words:1").unwrap()];
    let opts = RenderOptions {
        data: true,
        ..Default::default()
    };
    let lines = render_outputs(&run, &coords, opts).await.expect("render");
    assert_eq!(
        lines,
        vec!["words (depth 2) {", " Index:        1,0", " Error:        boom", "}"]
    );
}

#[tokio::test]
async fn total_size_sums_leaves() {
    let run = finished_run().await;
    let coords = vec![parse_coordinate("words").unwrap()];
    let opts = RenderOptions {
        total_size: true,
        ..Default::default()
    };
    let lines = render_outputs(&run, &coords, opts).await.expect("render");
    assert_eq!(lines[0], "words (depth 2, 2 bytes) {");
}

#[tokio::test]
async fn bad_coordinates_are_reported() {
    let run = finished_run().await;

    let out_of_range = vec![parse_coordinate("words:5").unwrap()];
    assert!(matches!(
        render_outputs(&run, &out_of_range, RenderOptions::default()).await,
        Err(Error::IndexOutOfRange { .. })
    ));

    let too_deep = vec![parse_coordinate("words:0,0,0").unwrap()];
    assert!(matches!(
        render_outputs(&run, &too_deep, RenderOptions::default()).await,
        Err(Error::IndexTooDeep { depth: 2, .. })
    ));

    let unknown = vec![parse_coordinate("nope").unwrap()];
    assert!(matches!(
        render_outputs(&run, &unknown, RenderOptions::default()).await,
        Err(Error::NoSuchPort { .. })
    ));
}

#[tokio::test]
async fn json_mode_emits_selected_subtrees() {
    let run = finished_run().await;
    let coords = vec![parse_coordinate("words:0").unwrap()];
    let opts = RenderOptions {
        json: true,
        total_size: true,
        ..Default::default()
    };
    let lines = render_outputs(&run, &coords, opts).await.expect("render");
    assert_eq!(lines.len(), 1);

    let v: serde_json::Value = serde_json::from_str(&lines[0]).expect("json");
    assert_eq!(v[0]["port"], "words");
    assert_eq!(v[0]["index"], serde_json::json!([0]));
    assert_eq!(v[0]["total_size"], 2);
    assert_eq!(v[0]["data"][0]["kind"], "inline");
    assert_eq!(v[0]["data"][1]["uri"], "http://h/wd/b");
}
