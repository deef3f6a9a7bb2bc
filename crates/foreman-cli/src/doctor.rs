//! Environment checks: `foreman doctor`.

use anyhow::Result;
use serde_json::json;

use foreman_core::config::ForemanConfig;
use foreman_core::PRODUCT_PREFIX;

struct Check {
    name: String,
    required: bool,
    ok: bool,
    detail: String,
}

pub async fn execute(as_json: bool) -> Result<i32> {
    let config = ForemanConfig::load_or_default();
    let mut checks = Vec::new();

    checks.push(check_binary("git", true));
    checks.push(check_binary("gh", true));
    for engine in &config.engines {
        let mut check = check_binary(&engine.program, false);
        check.name = format!("engine:{}", engine.name);
        checks.push(check);
    }
    checks.push(check_repo().await);
    checks.push(check_tempdir().await);

    // Engines are individually optional, but a run needs at least one.
    let any_engine = checks
        .iter()
        .any(|c| c.name.starts_with("engine:") && c.ok);
    checks.push(Check {
        name: "engines".into(),
        required: true,
        ok: any_engine,
        detail: if any_engine {
            "at least one engine available".into()
        } else {
            "no configured engine is on PATH".into()
        },
    });

    let ok = checks.iter().all(|c| c.ok || !c.required);

    if as_json {
        let output = json!({
            "ok": ok,
            "checks": checks.iter().map(|c| json!({
                "name": c.name,
                "required": c.required,
                "ok": c.ok,
                "detail": c.detail,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for check in &checks {
            let mark = if check.ok {
                "ok"
            } else if check.required {
                "FAIL"
            } else {
                "missing"
            };
            println!("  [{mark:>7}] {:<16} {}", check.name, check.detail);
        }
        println!();
        println!("{}", if ok { "doctor: ready" } else { "doctor: not ready" });
    }

    Ok(if ok { 0 } else { 1 })
}

fn check_binary(program: &str, required: bool) -> Check {
    match which::which(program) {
        Ok(path) => Check {
            name: program.to_string(),
            required,
            ok: true,
            detail: path.display().to_string(),
        },
        Err(_) => Check {
            name: program.to_string(),
            required,
            ok: false,
            detail: format!("'{program}' not found in PATH"),
        },
    }
}

async fn check_repo() -> Check {
    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => Check {
            name: "repository".into(),
            required: true,
            ok: true,
            detail: String::from_utf8_lossy(&out.stdout).trim().to_string(),
        },
        _ => Check {
            name: "repository".into(),
            required: true,
            ok: false,
            detail: "not inside a git repository".into(),
        },
    }
}

async fn check_tempdir() -> Check {
    let dir = std::env::temp_dir().join(format!("{PRODUCT_PREFIX}-worktrees"));
    let probe = dir.join(format!(".doctor-probe-{}", std::process::id()));
    let result = async {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(&probe, b"probe").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    match result {
        Ok(()) => Check {
            name: "tempdir".into(),
            required: true,
            ok: true,
            detail: dir.display().to_string(),
        },
        Err(e) => Check {
            name: "tempdir".into(),
            required: true,
            ok: false,
            detail: format!("{} is not writable: {e}", dir.display()),
        },
    }
}
