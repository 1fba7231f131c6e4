#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// First stdout line parsed as JSON (non-TTY stdout defaults to JSON).
    pub fn json(&self) -> Value {
        let line = self.stdout.lines().next().unwrap_or_default();
        serde_json::from_str(line).unwrap_or_else(|e| {
            panic!(
                "stdout is not JSON ({e}); log: {}",
                self.log_path.display()
            )
        })
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_avl") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "avl.exe" } else { "avl" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve avl binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("avl-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command.args(args).env("RUST_BACKTRACE", "1");
    for (key, _) in std::env::vars() {
        if key.starts_with("AVL_") {
            command.env_remove(key);
        }
    }
    let output = command.output().expect("execute avl command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

// ──────────────────── fixtures ────────────────────

pub const UUID_A: &str = "5c5c4a7b-0b1e-4b7f-9a3c-2f0e6d1c8a90";
pub const UUID_B: &str = "0f9e8d7c-6b5a-4c3d-8e1f-2a3b4c5d6e7f";

/// Temp directory laid out like a deployment, plus a config file pointing
/// at it.
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create workspace");
        let ws = Self { dir };
        fs::create_dir_all(ws.raw_dir()).expect("create raw dir");
        let config = format!(
            "[paths]\nraw_dir = \"{}\"\nout_dir = \"{}\"\nstate_dir = \"{}\"\n\
             sqlite_db = \"{}\"\njsonl_log = \"{}\"\n",
            ws.raw_dir().display(),
            ws.out_dir().display(),
            ws.state_dir().display(),
            ws.root().join("ledger.sqlite3").display(),
            ws.root().join("activity.jsonl").display(),
        );
        fs::write(ws.config_path(), config).expect("write config");
        ws
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root().join("raw")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root().join("out")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root().join("state")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root().join("avl.toml")
    }

    pub fn config_arg(&self) -> String {
        self.config_path().display().to_string()
    }

    pub fn read_out(&self, name: &str) -> String {
        fs::read_to_string(self.out_dir().join(name))
            .unwrap_or_else(|e| panic!("read {name}: {e}"))
    }

    /// One univaf API snapshot file.
    pub fn write_snapshot(&self, stamp: &str, rows: &[Value]) {
        fs::write(
            self.raw_dir().join(format!("locations_{stamp}.json")),
            serde_json::to_string(rows).expect("encode snapshot"),
        )
        .expect("write snapshot");
    }

    /// One gzipped vaccinespotter change log.
    pub fn write_change_log(&self, day: &str, entries: &[Value]) {
        let file = fs::File::create(self.raw_dir().join(format!("{day}.jsonl.gz")))
            .expect("create change log");
        let mut encoder = GzEncoder::new(file, Compression::default());
        for entry in entries {
            writeln!(encoder, "{entry}").expect("write entry");
        }
        encoder.finish().expect("finish gzip");
    }
}

/// A univaf snapshot row in New York.
pub fn snapshot_row(id: &str, valid_at: &str, available: &str, count: Option<u64>) -> Value {
    let mut availability = json!({"valid_at": valid_at, "available": available});
    if let Some(count) = count {
        availability["available_count"] = json!(count);
    }
    json!({
        "id": id,
        "name": "CVS PHARMACY #123",
        "provider": "CVS",
        "external_ids": [["cvs", format!("store-{id}")]],
        "address_lines": ["1 Main St"],
        "city": "boston",
        "state": "ma",
        "postal_code": "02115",
        "time_zone": "America/New_York",
        "availability": availability
    })
}
