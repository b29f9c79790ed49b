use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const SERVICE: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[derive(Parser)]
#[command(name = "rollcall", about = "Inspect and manage the rollcall attendance daemon", version)]
struct Cli {
    /// Talk to a daemon on the session bus (development mode)
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the live session state
    Status,
    /// Show one student record
    Student { id: String },
    /// List every student
    Students,
    /// Create or replace a student record
    AddStudent {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        major: String,
        #[arg(long, default_value = "")]
        standing: String,
        #[arg(long, default_value_t = 0)]
        year: u32,
        #[arg(long, default_value_t = 0)]
        starting_year: u32,
    },
    /// Enroll a face encoding from a JSON file (an array of 128 floats)
    Enroll { id: String, file: PathBuf },
    /// Show recent attendance events for a student
    History {
        id: String,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;

    match cli.command {
        Commands::Status => print_json(&call(&conn, "Status", &()).await?)?,
        Commands::Student { id } => {
            let body = call(&conn, "GetStudent", &(id.as_str(),)).await?;
            if serde_json::from_str::<Value>(&body)?.is_null() {
                bail!("no student with id {id}");
            }
            print_json(&body)?;
        }
        Commands::Students => print_json(&call(&conn, "ListStudents", &()).await?)?,
        Commands::AddStudent {
            id,
            name,
            major,
            standing,
            year,
            starting_year,
        } => {
            let student = serde_json::json!({
                "id": id,
                "name": name,
                "major": major,
                "standing": standing,
                "year": year,
                "starting_year": starting_year,
            });
            let reply = conn
                .call_method(
                    Some(SERVICE),
                    OBJECT_PATH,
                    Some(SERVICE),
                    "UpsertStudent",
                    &(student.to_string(),),
                )
                .await
                .context("UpsertStudent failed")?;
            let saved: bool = reply.body().deserialize()?;
            if saved {
                println!("saved student {id}");
            }
        }
        Commands::Enroll { id, file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let encoding: Vec<f32> = serde_json::from_str(&contents)
                .with_context(|| format!("{} is not a JSON array of floats", file.display()))?;
            tracing::debug!(dim = encoding.len(), "sending encoding");
            let face_id = call(
                &conn,
                "AddFace",
                &(id.as_str(), serde_json::to_string(&encoding)?),
            )
            .await?;
            println!("enrolled face {face_id} for {id}");
        }
        Commands::History { id, limit } => {
            print_json(&call(&conn, "History", &(id.as_str(), limit)).await?)?
        }
    }

    Ok(())
}

/// Call a daemon method whose reply is a single string.
async fn call<B>(conn: &zbus::Connection, method: &str, body: &B) -> Result<String>
where
    B: serde::Serialize + zbus::zvariant::DynamicType,
{
    let reply = conn
        .call_method(Some(SERVICE), OBJECT_PATH, Some(SERVICE), method, body)
        .await
        .with_context(|| format!("{method} failed"))?;
    Ok(reply.body().deserialize::<String>()?)
}

fn print_json(body: &str) -> Result<()> {
    let value: Value = serde_json::from_str(body).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
