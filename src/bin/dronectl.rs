//! dronectl - command-line client for the dronegate drone API
//!
//! Usage:
//!   dronectl list                        List running applications
//!   dronectl show <name>                 Show one application and its drones
//!   dronectl start <package.json>        Start a drone for an application
//!   dronectl stop <name>                 Stop every drone of an application
//!   dronectl restart <name>              Restart every drone of an application
//!   dronectl clean <name|package.json>   Stop an application and remove its source
//!   dronectl update <package.json>       Clean, fetch and start again
//!   dronectl cleanall                    Clean every application
//!   dronectl info                        One line per running drone
//!   dronectl deploy <user> <app> <tgz>   Upload a tarball and start it

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:9002";

/// Stored in ~/.dronectl/config.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CliConfig {
    api_url: Option<String>,
}

#[derive(Debug)]
enum Command {
    List,
    Show { name: String },
    Start { package: PathBuf },
    Stop { name: String },
    Restart { name: String },
    Clean { target: String },
    Update { package: PathBuf },
    CleanAll,
    Info,
    Deploy { user: String, app: String, tarball: PathBuf },
    ApiUrl { url: Option<String> },
    Help,
    Version,
}

/// Plain HTTP/1.1 client for the drone API
struct ApiClient {
    base_url: String,
}

impl ApiClient {
    fn new() -> Result<Self> {
        let config = load_config()?;
        let base_url = env::var("DRONECTL_API_URL")
            .ok()
            .or(config.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Ok(Self { base_url })
    }

    fn request(&self, method: &str, path: &str, body: &[u8], content_type: &str) -> Result<Value> {
        let url = self.base_url.trim_end_matches('/');
        let host_port = url.strip_prefix("http://").unwrap_or(url);

        let mut stream = TcpStream::connect(host_port)
            .with_context(|| format!("Failed to connect to drone API at {}", self.base_url))?;
        stream.set_read_timeout(Some(Duration::from_secs(300)))?;
        stream.set_write_timeout(Some(Duration::from_secs(300)))?;

        let head = format!(
            "{} {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n",
            method,
            path,
            host_port,
            content_type,
            body.len()
        );
        stream.write_all(head.as_bytes())?;
        stream.write_all(body)?;
        stream.flush()?;

        let mut response = String::new();
        stream.read_to_string(&mut response)?;

        let body = match response.find("\r\n\r\n") {
            Some(idx) => &response[idx + 4..],
            None => bail!("Malformed response from drone API"),
        };
        let value: Value = serde_json::from_str(body).context("Failed to parse API response")?;

        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            let stderr: Vec<&str> = error
                .get("stderr")
                .and_then(Value::as_array)
                .map(|lines| lines.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if stderr.is_empty() {
                bail!("{}", message);
            }
            bail!("{} ({})", message, stderr.join(" | "));
        }
        Ok(value)
    }

    fn get(&self, path: &str) -> Result<Value> {
        self.request("GET", path, b"", "application/json")
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request("POST", path, body.to_string().as_bytes(), "application/json")
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    match parse_command(&args) {
        Command::Help => print_help(),
        Command::Version => println!("dronectl {}", env!("CARGO_PKG_VERSION")),
        Command::ApiUrl { url } => handle_api_url(url)?,
        command => handle(ApiClient::new()?, command)?,
    }
    Ok(())
}

fn parse_command(args: &[String]) -> Command {
    let arg = |i: usize| args.get(i).cloned();
    match (args.first().map(String::as_str), arg(1), arg(2), arg(3)) {
        (Some("list") | Some("ls"), ..) => Command::List,
        (Some("show"), Some(name), ..) => Command::Show { name },
        (Some("start"), Some(package), ..) => Command::Start {
            package: PathBuf::from(package),
        },
        (Some("stop"), Some(name), ..) => Command::Stop { name },
        (Some("restart"), Some(name), ..) => Command::Restart { name },
        (Some("clean"), Some(target), ..) => Command::Clean { target },
        (Some("update"), Some(package), ..) => Command::Update {
            package: PathBuf::from(package),
        },
        (Some("cleanall"), ..) => Command::CleanAll,
        (Some("info"), ..) => Command::Info,
        (Some("deploy"), Some(user), Some(app), Some(tarball)) => Command::Deploy {
            user,
            app,
            tarball: PathBuf::from(tarball),
        },
        (Some("api-url"), url, ..) => Command::ApiUrl { url },
        (Some("version") | Some("--version") | Some("-V"), ..) => Command::Version,
        _ => Command::Help,
    }
}

fn handle(client: ApiClient, command: Command) -> Result<()> {
    match command {
        Command::List => {
            let apps = client.get("/drones")?;
            let apps = apps.as_object().cloned().unwrap_or_default();
            if apps.is_empty() {
                println!("No applications running");
            }
            for (name, runtime) in apps {
                let drones = runtime["drones"].as_array().cloned().unwrap_or_default();
                let user = runtime["app"]["user"].as_str().unwrap_or("");
                println!("{}/{}  {} drone(s)", user, name, drones.len());
                for drone in drones {
                    print_drone(&drone);
                }
            }
        }
        Command::Show { name } => {
            let runtime = client.get(&format!("/drones/{}", name))?;
            println!("{}", serde_json::to_string_pretty(&runtime)?);
        }
        Command::Start { package } => {
            let app = read_package(&package)?;
            let name = app_name(&app)?;
            let result = client.post(&format!("/drones/{}/start", name), &json!({ "start": app }))?;
            println!("Started {}", name);
            print_drone(&result["drone"]);
        }
        Command::Stop { name } => {
            let result = client.post(&format!("/drones/{}/stop", name), &json!({ "stop": { "name": name } }))?;
            let count = result["drones"].as_array().map(Vec::len).unwrap_or(0);
            println!("Stopped {} ({} drone(s))", name, count);
        }
        Command::Restart { name } => {
            let result = client.post(
                &format!("/drones/{}/restart", name),
                &json!({ "restart": { "name": name } }),
            )?;
            println!("Restarted {}", name);
            for drone in result["drones"].as_array().cloned().unwrap_or_default() {
                print_drone(&drone);
            }
        }
        Command::Clean { target } => {
            let app = if target.ends_with(".json") {
                read_package(Path::new(&target))?
            } else {
                let runtime = client.get(&format!("/drones/{}", target))?;
                runtime["app"].clone()
            };
            let name = app_name(&app)?;
            client.post(&format!("/drones/{}/clean", name), &json!({ "clean": app }))?;
            println!("Cleaned {}", name);
        }
        Command::Update { package } => {
            let app = read_package(&package)?;
            let name = app_name(&app)?;
            let result = client.post(&format!("/drones/{}/update", name), &json!({ "update": app }))?;
            println!("Updated {}", name);
            print_drone(&result["drone"]);
        }
        Command::CleanAll => {
            let result = client.post("/drones/cleanall", &json!({}))?;
            let cleaned: Vec<&str> = result["cleaned"]
                .as_array()
                .map(|names| names.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            println!("Cleaned {} application(s): {}", cleaned.len(), cleaned.join(", "));
        }
        Command::Info => {
            let rows = client.get("/drones/info")?;
            for row in rows.as_array().cloned().unwrap_or_default() {
                println!(
                    "{}/{}  {}:{}  version={}  hash={}  api_port={}",
                    row["user"].as_str().unwrap_or(""),
                    row["name"].as_str().unwrap_or(""),
                    row["host"].as_str().unwrap_or(""),
                    row["port"],
                    row["version"].as_str().unwrap_or("-"),
                    row["hash"].as_str().unwrap_or("-"),
                    row["haibuPort"],
                );
            }
        }
        Command::Deploy { user, app, tarball } => {
            let body = std::fs::read(&tarball)
                .with_context(|| format!("Failed to read {}", tarball.display()))?;
            println!("Uploading {} ({} bytes)", tarball.display(), body.len());
            let result = client.request(
                "POST",
                &format!("/drones/deploy/{}/{}", user, app),
                &body,
                "application/octet-stream",
            )?;
            println!("Deployed {}/{}", user, app);
            print_drone(&result["drone"]);
        }
        Command::ApiUrl { .. } | Command::Help | Command::Version => {}
    }
    Ok(())
}

fn handle_api_url(url: Option<String>) -> Result<()> {
    let mut config = load_config()?;
    match url {
        Some(url) => {
            config.api_url = Some(url.clone());
            save_config(&config)?;
            println!("API URL set to {}", url);
        }
        None => println!(
            "{}",
            config.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
        ),
    }
    Ok(())
}

fn print_drone(drone: &Value) {
    println!(
        "  pid {}  {}:{}  started {}",
        drone["pid"],
        drone["host"].as_str().unwrap_or(""),
        drone["port"],
        drone["ctime"].as_str().unwrap_or("-"),
    );
}

fn read_package(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn app_name(app: &Value) -> Result<String> {
    match app["name"].as_str() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => bail!("Application has no name"),
    }
}

fn print_help() {
    println!(
        r#"
dronectl - manage applications on a dronegate host

USAGE:
    dronectl <command> [arguments]

COMMANDS:
    list                         List running applications
    show <name>                  Show one application and its drones
    start <package.json>         Start a drone for an application
    stop <name>                  Stop every drone of an application
    restart <name>               Restart every drone of an application
    clean <name|package.json>    Stop an application and remove its source
    update <package.json>        Clean, fetch and start again
    cleanall                     Clean every application
    info                         One line per running drone
    deploy <user> <app> <tgz>    Upload a gzipped tarball and start it
    api-url [url]                Show or set the API URL

    help                         Show this help
    version                      Show version

ENVIRONMENT:
    DRONECTL_API_URL             API endpoint (default: {})
"#,
        DEFAULT_API_URL
    );
}

fn config_path() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dronectl")
        .join("config.json")
}

fn load_config() -> Result<CliConfig> {
    let path = config_path();
    if !path.exists() {
        return Ok(CliConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    serde_json::from_str(&content).context("Failed to parse config file")
}

fn save_config(config: &CliConfig) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert!(matches!(parse_command(&args(&["list"])), Command::List));
        assert!(matches!(
            parse_command(&args(&["stop", "test"])),
            Command::Stop { ref name } if name == "test"
        ));
        assert!(matches!(
            parse_command(&args(&["deploy", "marak", "test", "app.tgz"])),
            Command::Deploy { ref user, ref app, .. } if user == "marak" && app == "test"
        ));
        assert!(matches!(parse_command(&args(&["api-url"])), Command::ApiUrl { url: None }));
    }

    #[test]
    fn test_incomplete_commands_show_help() {
        assert!(matches!(parse_command(&args(&[])), Command::Help));
        assert!(matches!(parse_command(&args(&["stop"])), Command::Help));
        assert!(matches!(parse_command(&args(&["deploy", "marak", "test"])), Command::Help));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(app_name(&json!({ "name": "test" })).unwrap(), "test");
        assert!(app_name(&json!({ "user": "marak" })).is_err());
    }
}
