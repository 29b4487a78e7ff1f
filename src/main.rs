// AC Transit live map server with embedded frontend
// Polls the 511 SF Bay VehicleMonitoring API and serves the map UI

use actix_web::{web, App, HttpServer, HttpResponse, middleware};
use actix_cors::Cors;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;

mod siri_api_models;
use siri_api_models::{
    derive_filtered, derive_lines, format_timestamp_full, get_current_timestamp,
    LineDescriptor, RefreshPhase, TransitClient, TransitError, VehicleCache, VehicleRecord,
};

// Embed static files at compile time
const INDEX_HTML: &str = include_str!("../static/livemap.html");
const MAP_JS: &str = include_str!("../static/transit-map.js");

// 61 seconds: the API allows 60 requests an hour, so poll just under once
// a minute to stay inside the limit with a little margin.
const REFRESH_INTERVAL_SECS: u64 = 61;

#[derive(Clone)]
struct AppState {
    cache: Arc<Mutex<VehicleCache>>,
    client: Arc<TransitClient>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
    sources: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: get_current_timestamp(),
            sources: vec!["511.org".to_string()],
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: get_current_timestamp(),
            sources: vec![],
        }
    }
}

// ============================================================================
// Frontend Routes
// ============================================================================

async fn serve_index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

async fn serve_js() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/javascript; charset=utf-8")
        .body(MAP_JS)
}

// ============================================================================
// API Endpoints
// ============================================================================

#[derive(Deserialize)]
struct VehicleQuery {
    line: Option<String>,
}

async fn get_vehicles(
    state: web::Data<AppState>,
    query: web::Query<VehicleQuery>,
) -> HttpResponse {
    let selected = query.line.clone().unwrap_or_default();

    match state.cache.lock() {
        Ok(cache) => {
            let vehicles = derive_filtered(&cache.vehicles, &selected);
            if selected.is_empty() {
                println!("🚌 Vehicles requested: {} active", vehicles.len());
            } else {
                println!(
                    "🚌 Vehicles requested: {} of {} on line {}",
                    vehicles.len(),
                    cache.vehicles.len(),
                    selected
                );
            }
            HttpResponse::Ok().json(ApiResponse::success(vehicles))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<Vec<VehicleRecord>>::error(
                    "Failed to retrieve vehicles".to_string()
                ))
        }
    }
}

async fn get_lines(state: web::Data<AppState>) -> HttpResponse {
    match state.cache.lock() {
        Ok(cache) => {
            let lines = derive_lines(&cache.vehicles);
            println!("🚏 Lines requested: {} distinct", lines.len());
            HttpResponse::Ok().json(ApiResponse::success(lines))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<Vec<LineDescriptor>>::error(
                    "Failed to retrieve lines".to_string()
                ))
        }
    }
}

async fn get_status(state: web::Data<AppState>) -> HttpResponse {
    match state.cache.lock() {
        Ok(cache) => {
            println!("📊 Status requested");
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
                "phase": cache.phase,
                "vehicle_count": cache.vehicles.len(),
                "last_updated": cache.last_updated,
                "last_updated_pretty": cache.last_updated.map(format_timestamp_full),
                "last_error": cache.last_error,
                "refresh_interval_secs": REFRESH_INTERVAL_SECS,
            })))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error(
                    "Failed to retrieve status".to_string()
                ))
        }
    }
}

async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    println!("🔄 Manual refresh requested...");

    if !enter_loading(&state) {
        return HttpResponse::Conflict()
            .json(ApiResponse::<String>::error(
                "A refresh is already in flight".to_string()
            ));
    }

    execute_fetch(&state).await;

    match state.cache.lock() {
        Ok(cache) => match cache.phase {
            RefreshPhase::Idle => {
                println!("✓ Manual refresh completed successfully");
                HttpResponse::Ok().json(ApiResponse::success(
                    format!("Refreshed {} vehicles", cache.vehicles.len())
                ))
            }
            _ => HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error(
                    cache.last_error.clone()
                        .unwrap_or_else(|| "Refresh failed".to_string())
                )),
        },
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error(
                    "Failed to report refresh result".to_string()
                ))
        }
    }
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "AC Transit Live Map",
        "version": "0.1.0",
        "agency": TransitClient::DEFAULT_AGENCY,
        "timestamp": get_current_timestamp(),
        "embedded_frontend": true
    }))
}

// ============================================================================
// Background Task
// ============================================================================

fn enter_loading(state: &AppState) -> bool {
    match state.cache.lock() {
        Ok(mut cache) => cache.begin_refresh(),
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            false
        }
    }
}

async fn execute_fetch(state: &AppState) {
    let client = state.client.clone();
    let result = tokio::task::spawn_blocking(move || client.fetch_vehicles()).await;

    match state.cache.lock() {
        Ok(mut cache) => match result {
            Ok(Ok(vehicles)) => {
                println!(
                    "✓ Refreshed {} vehicles at {}",
                    vehicles.len(),
                    format_timestamp_full(get_current_timestamp())
                );
                cache.apply_success(vehicles, get_current_timestamp());
            }
            Ok(Err(e)) => {
                eprintln!("⚠️  Vehicle refresh failed: {}", e);
                cache.apply_failure(&e);
            }
            Err(e) => {
                eprintln!("❌ Vehicle refresh task panicked: {}", e);
                cache.apply_failure(&TransitError::NetworkError(
                    format!("Fetch task panicked: {}", e)
                ));
            }
        },
        Err(e) => eprintln!("❌ Failed to lock cache: {}", e),
    }
}

async fn data_refresh_task(state: AppState) {
    // The cache is constructed in the loading phase, so the first fetch
    // runs immediately instead of waiting out a full interval.
    execute_fetch(&state).await;

    let mut interval = time::interval(Duration::from_secs(REFRESH_INTERVAL_SECS));
    interval.tick().await; // the first tick completes immediately

    loop {
        interval.tick().await;

        println!("\n🔄 Auto-refreshing vehicle positions...");

        if !enter_loading(&state) {
            println!("⏳ Previous fetch still in flight, skipping this cycle");
            continue;
        }

        execute_fetch(&state).await;
    }
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(client: TransitClient) -> std::io::Result<()> {
    let app_state = AppState {
        cache: Arc::new(Mutex::new(VehicleCache::new())),
        client: Arc::new(client),
    };

    // Start background refresh task
    let refresh_state = app_state.clone();
    let refresh_task = tokio::spawn(async move {
        data_refresh_task(refresh_state).await;
    });

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║   🚌 AC Transit Live Map Server (Embedded UI)              ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");
    println!("🌐 Server running on: http://0.0.0.0:8080");
    println!("📱 Web UI available at: http://localhost:8080");
    println!("📡 API available at: http://localhost:8080/api/transit");
    println!("🔄 Auto-refresh: Every {} seconds\n", REFRESH_INTERVAL_SECS);

    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ Frontend:                                                   │");
    println!("│   GET  /                           - Web UI (embedded)      │");
    println!("│   GET  /transit-map.js             - JavaScript (embedded)  │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ API:                                                        │");
    println!("│   GET  /api/transit/vehicles       - Vehicles (?line=...)   │");
    println!("│   GET  /api/transit/lines          - Active lines           │");
    println!("│   GET  /api/transit/status         - Refresh status         │");
    println!("│   POST /api/transit/refresh        - Force refresh now      │");
    println!("│   GET  /health                     - Health check           │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    let result = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            // Frontend routes
            .route("/", web::get().to(serve_index))
            .route("/transit-map.js", web::get().to(serve_js))
            // Health check
            .route("/health", web::get().to(health_check))
            // API routes
            .service(
                web::scope("/api/transit")
                    .route("/vehicles", web::get().to(get_vehicles))
                    .route("/lines", web::get().to(get_lines))
                    .route("/status", web::get().to(get_status))
                    .route("/refresh", web::post().to(force_refresh))
            )
    })
        .bind(("0.0.0.0", 8080))?
        .run()
        .await;

    // The poller must not outlive the server: once shutdown completes no
    // further state transitions may happen.
    refresh_task.abort();

    result
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║                                                            ║");
    println!("║    🚌 AC Transit Live Map                                  ║");
    println!("║       511 SF Bay VehicleMonitoring + Embedded Web UI       ║");
    println!("║                                                            ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");

    let client = match TransitClient::from_env() {
        Ok(client) => {
            println!("✓ 511 API key loaded (agency: {})", client.agency());
            client
        }
        Err(e) => {
            eprintln!("❌ {}", e);
            eprintln!("\n💡 Troubleshooting:");
            eprintln!("   1. Request a free token at https://511.org/open-data/token");
            eprintln!("   2. Export it as TRANSIT_511_API_KEY before starting the server\n");
            std::process::exit(1);
        }
    };

    actix_web::rt::System::new().block_on(run_server(client))
}
