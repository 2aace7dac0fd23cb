use clap::{Parser, Subcommand};
use reqwest::blocking::{Client, Response};
use reqwest::header::{COOKIE, SET_COOKIE, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{exit, Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const SMOKE_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const REFRESH_COOKIE: &str = "refresh_token";

#[derive(Parser)]
#[command(author, version, about = "Developer tasks for the sessionward workspace")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    #[command(about = "Run `cargo fmt --all`")]
    Fmt,
    #[command(about = "Run format + clippy lint checks")]
    Lint,
    #[command(about = "Execute `cargo test --workspace`")]
    Test,
    #[command(about = "Run fmt + clippy + test sequence")]
    Ci,
    #[command(about = "Run the server in memory mode and drive the register/refresh/logout flow")]
    AuthSmoke,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

fn main() {
    let cli = Cli::parse();

    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(|p| p.to_path_buf())
        .expect("workspace root");

    let result = match cli.command {
        Task::Fmt => run_commands(&workspace_root, [("cargo", &["fmt", "--all"])]),
        Task::Lint => run_commands(
            &workspace_root,
            [
                ("cargo", &["fmt", "--all", "--", "--check"]),
                ("cargo", &["clippy", "--workspace", "--", "-D", "warnings"]),
            ],
        ),
        Task::Test => run_commands(&workspace_root, [("cargo", &["test", "--workspace"])]),
        Task::Ci => run_ci(&workspace_root),
        Task::AuthSmoke => run_auth_smoke(&workspace_root),
    };

    if !result {
        exit(1);
    }
}

fn run_ci(workspace_root: &Path) -> bool {
    if !run_commands(
        workspace_root,
        [
            ("cargo", &["fmt", "--all", "--", "--check"]),
            ("cargo", &["clippy", "--workspace", "--", "-D", "warnings"]),
        ],
    ) {
        return false;
    }
    run_commands(
        workspace_root,
        [
            ("cargo", &["test", "--workspace"]),
            ("cargo", &["test", "-p", "sessionward-server", "--features", "metrics"]),
        ],
    )
}

fn run_auth_smoke(workspace_root: &Path) -> bool {
    if !run_commands(
        workspace_root,
        [(
            "cargo",
            &["build", "--features", "metrics", "-p", "sessionward-server"],
        )],
    ) {
        return false;
    }

    let Some(port) = reserve_port() else {
        eprintln!("failed to reserve a free TCP port");
        return false;
    };
    let bind_addr = format!("127.0.0.1:{port}");

    let mut child = match spawn_server(workspace_root, &bind_addr) {
        Ok(child) => child,
        Err(err) => {
            eprintln!("failed to launch sessionward-server: {err}");
            return false;
        }
    };

    let result = match Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(client) => {
            let base_url = format!("http://{bind_addr}");
            if !wait_for_ready(&client, &format!("{base_url}/ready"), Duration::from_secs(30)) {
                eprintln!("server failed to respond within timeout");
                false
            } else {
                match drive_auth_flow(&client, &base_url) {
                    Ok(()) => {
                        println!("auth smoke passed");
                        true
                    }
                    Err(message) => {
                        eprintln!("auth smoke failed: {message}");
                        false
                    }
                }
            }
        }
        Err(err) => {
            eprintln!("failed to build HTTP client: {err}");
            false
        }
    };

    if let Err(err) = child.kill() {
        if err.kind() != std::io::ErrorKind::InvalidInput {
            eprintln!("failed to terminate server process: {err}");
        }
    }
    let _ = child.wait();

    result
}

fn spawn_server(workspace_root: &Path, bind_addr: &str) -> std::io::Result<Child> {
    Command::new("cargo")
        .args([
            "run",
            "--quiet",
            "--features",
            "metrics",
            "-p",
            "sessionward-server",
            "--",
            "--bind-addr",
            bind_addr,
            "--metrics-enabled",
            "true",
        ])
        .env("RUST_LOG", "warn")
        .env_remove("SESSIONWARD_SERVER__DATABASE_URL")
        .current_dir(workspace_root)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
}

fn drive_auth_flow(client: &Client, base_url: &str) -> Result<(), String> {
    let credentials = json!({"username": "smoke_user", "password": "smoke-pass-123"});

    let response = client
        .post(format!("{base_url}/auth/register"))
        .header(USER_AGENT, SMOKE_USER_AGENT)
        .json(&credentials)
        .send()
        .map_err(|err| format!("register request failed: {err}"))?;
    expect_status(&response, StatusCode::CREATED, "register")?;
    let cookie = refresh_cookie(&response).ok_or("register did not set a refresh cookie")?;
    let tokens: TokenResponse = response
        .json()
        .map_err(|err| format!("register body: {err}"))?;

    let response = client
        .get(format!("{base_url}/users/me"))
        .bearer_auth(&tokens.access_token)
        .send()
        .map_err(|err| format!("profile request failed: {err}"))?;
    expect_status(&response, StatusCode::OK, "profile")?;

    let response = client
        .post(format!("{base_url}/auth/login"))
        .header(USER_AGENT, SMOKE_USER_AGENT)
        .json(&credentials)
        .send()
        .map_err(|err| format!("login request failed: {err}"))?;
    expect_status(&response, StatusCode::OK, "login")?;

    let response = client
        .post(format!("{base_url}/auth/refresh"))
        .header(COOKIE, &cookie)
        .send()
        .map_err(|err| format!("refresh request failed: {err}"))?;
    expect_status(&response, StatusCode::OK, "refresh")?;

    let response = client
        .post(format!("{base_url}/auth/logout"))
        .header(COOKIE, &cookie)
        .send()
        .map_err(|err| format!("logout request failed: {err}"))?;
    expect_status(&response, StatusCode::OK, "logout")?;

    let response = client
        .post(format!("{base_url}/auth/refresh"))
        .header(COOKIE, &cookie)
        .send()
        .map_err(|err| format!("post-logout refresh failed: {err}"))?;
    expect_status(&response, StatusCode::FORBIDDEN, "refresh after logout")?;

    let body = client
        .get(format!("{base_url}/metrics"))
        .send()
        .and_then(|response| response.text())
        .map_err(|err| format!("metrics request failed: {err}"))?;
    if !body.contains("sessionward_logins_total") {
        return Err("metrics endpoint responded without login counters".into());
    }

    Ok(())
}

fn expect_status(response: &Response, expected: StatusCode, step: &str) -> Result<(), String> {
    if response.status() == expected {
        Ok(())
    } else {
        Err(format!(
            "{step}: expected {expected}, got {}",
            response.status()
        ))
    }
}

fn refresh_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .find(|pair| pair.starts_with(&format!("{REFRESH_COOKIE}=")))
        .map(str::to_string)
}

fn reserve_port() -> Option<u16> {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .ok()
}

fn wait_for_ready(client: &Client, url: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match client.get(url).send() {
            Ok(response) if response.status().is_success() => return true,
            Ok(_) | Err(_) => sleep(Duration::from_millis(500)),
        }
    }
    false
}

fn run_commands<const N: usize>(workspace_root: &Path, commands: [(&str, &[&str]); N]) -> bool {
    for (program, args) in commands {
        let status = Command::new(program)
            .args(args)
            .current_dir(workspace_root)
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                eprintln!("command '{program} {}' failed with {status}", args.join(" "));
                return false;
            }
            Err(err) => {
                eprintln!("failed to spawn '{program}': {err}");
                return false;
            }
        }
    }
    true
}
