use serde_json::{json, Value};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};

const INSTALLER: &str = r#"#!/bin/sh
echo "Installing $2"
echo "Overwrite existing files? (y/n)"
read answer
echo "answer: $answer"
echo "Press Enter to continue"
read enter
echo "deprecated option" >&2
test -f "$2" || exit 3
if [ "$2" = "broken.blueprint" ]; then
    exit 1
fi
exit 0
"#;

async fn wait_for_socket(path: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Path::new(path).exists() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("Socket did not appear: {}", path);
        }
        sleep(Duration::from_millis(50)).await;
    }
}

async fn connect(socket_path: &str) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = UnixStream::connect(socket_path).await.unwrap();
    let (reader, writer) = stream.into_split();
    (BufReader::new(reader), writer)
}

async fn send(writer: &mut OwnedWriteHalf, request: Value) {
    let request_json = serde_json::to_string(&request).unwrap();
    writer.write_all(request_json.as_bytes()).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
    writer.flush().await.unwrap();
}

async fn receive(reader: &mut BufReader<OwnedReadHalf>) -> Value {
    let mut line = String::new();
    timeout(Duration::from_secs(10), reader.read_line(&mut line))
        .await
        .expect("Timed out waiting for a response")
        .unwrap();
    serde_json::from_str(line.trim()).unwrap()
}

async fn send_request(socket_path: &str, request: Value) -> Value {
    let (mut reader, mut writer) = connect(socket_path).await;
    send(&mut writer, request).await;
    receive(&mut reader).await
}

#[tokio::test]
async fn test_end_to_end_install_via_socket() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("root");
    let staging = dir.path().join("staging");
    let uploads = dir.path().join("uploads");
    for d in [&root, &staging, &uploads] {
        std::fs::create_dir_all(d).unwrap();
    }

    let installer = dir.path().join("installer.sh");
    std::fs::write(&installer, INSTALLER).unwrap();
    std::fs::set_permissions(&installer, std::fs::Permissions::from_mode(0o755)).unwrap();

    for name in ["good.blueprint", "broken.blueprint"] {
        std::fs::write(uploads.join(name), name.as_bytes()).unwrap();
    }

    let socket_path = dir.path().join("queue.sock").to_string_lossy().to_string();

    let mut child = Command::new(env!("CARGO_BIN_EXE_blueprint-queue"))
        .env("BLUEPRINT_QUEUE_TOKEN", "test-token")
        .arg("--socket")
        .arg(&socket_path)
        .arg("--install-root")
        .arg(&root)
        .arg("--staging-dir")
        .arg(&staging)
        .arg("--installer")
        .arg(&installer)
        .arg("--cooldown")
        .arg("0")
        .arg("--run-interval")
        .arg("3600")
        .arg("--log-level")
        .arg("error")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    wait_for_socket(&socket_path).await;

    // Unsupported file types never reach the queue
    let response = send_request(
        &socket_path,
        json!({
            "type": "submit",
            "artifact_name": "theme.zip",
            "payload": {"path": uploads.join("good.blueprint")},
        }),
    )
    .await;
    assert_eq!(response["type"], "rejected");

    let (mut reader, mut writer) = connect(&socket_path).await;
    for (expected_position, name) in [(1, "good.blueprint"), (2, "broken.blueprint")] {
        send(
            &mut writer,
            json!({
                "type": "submit",
                "artifact_name": name,
                "payload": {"path": uploads.join(name)},
            }),
        )
        .await;
        let response = receive(&mut reader).await;
        assert_eq!(response["type"], "queued");
        assert_eq!(response["artifact_name"], name);
        // The first periodic tick may already be draining
        assert!(response["position"].as_u64().unwrap() <= expected_position);
    }

    send(&mut writer, json!({"type": "run"})).await;

    let mut finished: HashMap<String, Value> = HashMap::new();
    while finished.len() < 2 {
        let response = receive(&mut reader).await;
        match response["type"].as_str().unwrap() {
            "run_triggered" => {}
            "job_status" => {
                let update = &response["update"];
                match update["status"].as_str().unwrap() {
                    "finished" | "failed" => {
                        let name = response["artifact_name"].as_str().unwrap().to_string();
                        finished.insert(name, update.clone());
                    }
                    _ => {}
                }
            }
            other => panic!("Unexpected response type {}: {}", other, response),
        }
    }

    let good = &finished["good.blueprint"];
    assert_eq!(good["status"], "finished");
    assert_eq!(good["succeeded"], true);
    assert_eq!(good["exit_code"], 0);
    let output = good["output"].as_str().unwrap();
    assert!(output.contains("answer: yes"), "output: {}", output);
    assert!(output.ends_with("\n\nErrors:\ndeprecated option\n"), "output: {}", output);

    let broken = &finished["broken.blueprint"];
    assert_eq!(broken["status"], "finished");
    assert_eq!(broken["succeeded"], false);
    assert_eq!(broken["exit_code"], 1);

    // Artifacts stay in the install root, working copies are gone
    assert!(root.join("good.blueprint").exists());
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);

    let response = send_request(&socket_path, json!({"type": "status"})).await;
    assert_eq!(response["type"], "status");
    assert_eq!(response["length"], 0);

    let response = send_request(&socket_path, json!({"type": "stop"})).await;
    assert_eq!(response["type"], "stop");
    assert_eq!(response["accepted"], false);

    let response = send_request(&socket_path, json!({"type": "shutdown"})).await;
    assert_eq!(response["type"], "shutdown_ack");

    let status = timeout(Duration::from_secs(5), child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
    assert!(!Path::new(&socket_path).exists());
}

#[tokio::test]
async fn test_refuses_to_start_without_token() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("queue.sock");

    let status = Command::new(env!("CARGO_BIN_EXE_blueprint-queue"))
        .env_remove("BLUEPRINT_QUEUE_TOKEN")
        .arg("--socket")
        .arg(&socket_path)
        .arg("--log-level")
        .arg("error")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .unwrap();

    assert_eq!(status.code(), Some(1));
    assert!(!socket_path.exists());
}
