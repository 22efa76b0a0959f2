use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Base URL of the rollcalld server
    #[arg(long, env = "ROLLCALL_SERVER", default_value = "http://127.0.0.1:5000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new person from a photo with exactly one face
    Register {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
        /// student, teacher or admin (server default: student)
        #[arg(short, long)]
        role: Option<String>,
        /// Path to the photo
        image: PathBuf,
    },
    /// Mark attendance for the person in the photo
    Mark {
        /// Path to the photo
        image: PathBuf,
    },
    /// List registered people
    Users,
    /// List attendance records, newest first
    Attendance {
        /// First day to include (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,
        /// Last day to include (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,
    },
    /// Show server status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.server.trim_end_matches('/');

    let request = match cli.command {
        Commands::Register {
            name,
            email,
            role,
            image,
        } => {
            let mut form = Form::new()
                .text("name", name)
                .text("email", email)
                .part("image", image_part(&image).await?);
            if let Some(role) = role {
                form = form.text("role", role);
            }
            client.post(format!("{base}/users/register")).multipart(form)
        }
        Commands::Mark { image } => {
            let form = Form::new().part("image", image_part(&image).await?);
            client.post(format!("{base}/attendance/mark")).multipart(form)
        }
        Commands::Users => client.get(format!("{base}/users")),
        Commands::Attendance { start, end } => client
            .get(format!("{base}/attendance"))
            .query(&date_query(start, end)),
        Commands::Status => client.get(format!("{base}/status")),
    };

    tracing::debug!(server = base, "sending request");
    let response = request
        .send()
        .await
        .with_context(|| format!("failed to reach rollcalld at {base}"))?;
    let status = response.status();
    let body = response.text().await.context("failed to read response")?;

    if !status.is_success() {
        bail!("{} ({})", error_message(&body), status);
    }

    let json: Value = serde_json::from_str(&body).context("server returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn image_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    Ok(Part::bytes(bytes).file_name(file_name))
}

fn date_query(start: Option<String>, end: Option<String>) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(start) = start {
        query.push(("startDate", start));
    }
    if let Some(end) = end {
        query.push(("endDate", end));
    }
    query
}

/// Pull `message` out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(r#"{"message":"face not recognized"}"#),
            "face not recognized"
        );
        assert_eq!(error_message("Bad Gateway\n"), "Bad Gateway");
        assert_eq!(error_message(r#"{"error":"x"}"#), r#"{"error":"x"}"#);
    }

    #[test]
    fn test_date_query() {
        assert!(date_query(None, None).is_empty());
        assert_eq!(
            date_query(Some("2026-03-01".into()), None),
            vec![("startDate", "2026-03-01".to_string())]
        );
        assert_eq!(date_query(None, Some("2026-03-31".into())).len(), 1);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "--server",
            "http://host:8080/",
            "register",
            "--name",
            "Ada",
            "--email",
            "ada@example.com",
            "face.jpg",
        ])
        .unwrap();
        assert_eq!(cli.server, "http://host:8080/");
        match cli.command {
            Commands::Register { role, image, .. } => {
                assert!(role.is_none());
                assert_eq!(image, PathBuf::from("face.jpg"));
            }
            _ => panic!("expected register"),
        }
    }
}
