//! HTTP server for the data movement API.
//! Simple HTTP server using tokio and basic HTTP handling.

use anyhow::Result;
use chbridge::api::{
    handle_columns, handle_connect, handle_file_to_store, handle_join, handle_store_to_file,
    handle_tables, ApiResponse, FileToStoreRequest, JoinRequest, StoreToFileRequest,
};
use chbridge::ConnectionSpec;
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chbridge-server")]
#[command(about = "Bulk transfer service between ClickHouse and flat files")]
#[command(version)]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0", env = "CHBRIDGE_BIND")]
    bind: String,

    /// Listen port
    #[arg(long, default_value_t = 8000, env = "CHBRIDGE_PORT")]
    port: u16,

    /// Directory where exported files are written
    #[arg(long, default_value = ".", env = "CHBRIDGE_OUTPUT_DIR")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.output_dir)?;

    let listener = TcpListener::bind((args.bind.as_str(), args.port)).await?;
    info!(bind = %args.bind, port = args.port, output_dir = %args.output_dir.display(), "server listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        let output_dir = args.output_dir.clone();
        info!(%addr, "new connection");
        tokio::spawn(async move {
            handle_connection(stream, output_dir).await;
        });
    }
}

async fn handle_connection(mut stream: TcpStream, output_dir: PathBuf) {
    use tokio::time::{timeout, Duration};

    // Read the request with a timeout to prevent hanging.
    let mut buffer = Vec::new();
    let mut temp_buf = [0; 8192];

    let read_result = timeout(Duration::from_secs(30), async {
        loop {
            match stream.read(&mut temp_buf).await {
                Ok(0) => break, // EOF
                Ok(n) => {
                    buffer.extend_from_slice(&temp_buf[..n]);
                    if let Ok(s) = std::str::from_utf8(&buffer) {
                        if let Some(headers_end) = s.find("\r\n\r\n") {
                            if let Some(content_length) = extract_content_length(s) {
                                if buffer.len() >= headers_end + 4 + content_length {
                                    break; // Complete request
                                }
                            } else if n < temp_buf.len() {
                                break;
                            }
                        }
                    }
                    // Bound request size.
                    if buffer.len() > 64_000_000 {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to read from stream");
                    return Err(e);
                }
            }
        }
        Ok(())
    })
    .await;

    if read_result.is_err() {
        warn!("request read timeout");
        return;
    }
    if buffer.is_empty() {
        return;
    }

    match String::from_utf8(buffer) {
        Ok(request) => {
            let response = handle_request(&request, &output_dir).await;
            if let Err(e) = stream.write_all(response.as_bytes()).await {
                error!(error = %e, "failed to write response");
            }
        }
        Err(e) => {
            error!(error = %e, "failed to parse request as UTF-8");
        }
    }
}

fn extract_content_length(request: &str) -> Option<usize> {
    for line in request.lines() {
        if line.to_lowercase().starts_with("content-length:") {
            if let Some(value) = line.split(':').nth(1) {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

fn extract_body(request: &str) -> &str {
    request
        .find("\r\n\r\n")
        .map(|idx| request[idx + 4..].trim())
        .unwrap_or("")
}

fn query_param<'a>(query_string: Option<&'a str>, key: &str) -> Option<&'a str> {
    query_string?.split('&').find_map(|param| {
        let (k, v) = param.split_once('=')?;
        (k == key).then_some(v)
    })
}

async fn handle_request(request: &str, output_dir: &PathBuf) -> String {
    let request_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return create_response(400, "Bad Request", "{}");
    }

    let method = parts[0];
    let full_path = parts[1];
    let (path, query_string) = match full_path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (full_path, None),
    };
    let path = path.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    info!(method, path, "request");

    if method == "OPTIONS" {
        return create_response(204, "No Content", "");
    }

    match (method, path) {
        ("GET", "/api/health") => {
            create_response(200, "OK", r#"{"status":"ok","service":"chbridge"}"#)
        }
        ("POST", "/api/connect") => match parse_body::<ConnectionSpec>(request) {
            Ok(spec) => respond(handle_connect(spec).await),
            Err(resp) => resp,
        },
        ("POST", "/api/tables") => match parse_body::<ConnectionSpec>(request) {
            Ok(spec) => respond(handle_tables(spec).await),
            Err(resp) => resp,
        },
        ("POST", "/api/columns") => {
            let Some(table) = query_param(query_string, "table") else {
                return create_response(
                    400,
                    "Bad Request",
                    r#"{"status":"error","kind":"validation_error","message":"query parameter 'table' is required"}"#,
                );
            };
            match parse_body::<ConnectionSpec>(request) {
                Ok(spec) => respond(handle_columns(spec, table).await),
                Err(resp) => resp,
            }
        }
        ("POST", "/api/ingest/clickhouse-to-file") => {
            match parse_body::<StoreToFileRequest>(request) {
                Ok(req) => respond(handle_store_to_file(req, output_dir).await),
                Err(resp) => resp,
            }
        }
        ("POST", "/api/ingest/file-to-clickhouse") => {
            match parse_body::<FileToStoreRequest>(request) {
                Ok(req) => respond(handle_file_to_store(req).await),
                Err(resp) => resp,
            }
        }
        ("POST", "/api/join-tables") => match parse_body::<JoinRequest>(request) {
            Ok(req) => respond(handle_join(req, output_dir).await),
            Err(resp) => resp,
        },
        _ => create_response(
            404,
            "Not Found",
            r#"{"status":"error","kind":"validation_error","message":"no such endpoint"}"#,
        ),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(request: &str) -> Result<T, String> {
    let body = extract_body(request);
    if body.is_empty() {
        return Err(create_response(
            400,
            "Bad Request",
            r#"{"status":"error","kind":"validation_error","message":"JSON body required"}"#,
        ));
    }
    serde_json::from_str(body).map_err(|e| {
        let detail = serde_json::json!({
            "status": "error",
            "kind": "validation_error",
            "message": format!("invalid request body: {}", e),
        });
        create_response(400, "Bad Request", &detail.to_string())
    })
}

fn respond(response: ApiResponse) -> String {
    let status_text = match response.code {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        _ => "Error",
    };
    create_response(response.code, status_text, &response.body.to_string())
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
