//! 守护进程 HTTP 服务
//!
//! 本机回环地址上的受令牌保护路由，供 CLI、终端 UI 和浏览器
//! 扩展驱动同一个下载池。CORS 只放行浏览器扩展源和本机源，
//! 主机名按相等或 host: 前缀精确匹配，杜绝子域伪装绕过

pub mod handlers;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::Request,
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use subtle::ConstantTimeEq;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{surge_dir, Settings};
use crate::pool::WorkerPool;

/// 服务端共享状态
#[derive(Clone)]
pub struct ServerState {
    pub pool: Arc<WorkerPool>,
    pub settings: Settings,
    pub token: String,
}

/// 校验请求来源
///
/// 允许：浏览器扩展协议前缀、http://localhost 与 http://127.0.0.1
/// （裸主机或带端口）。主机名必须完全相等或以 `host:` 开头，
/// localhost.evil.com 之类的前缀伪装不放行
pub fn check_origin(origin: &str) -> bool {
    if origin.is_empty() {
        return false;
    }
    if origin.starts_with("chrome-extension://")
        || origin.starts_with("moz-extension://")
        || origin.starts_with("safari-web-extension://")
    {
        return true;
    }
    for host in ["http://localhost", "http://127.0.0.1"] {
        if origin == host || origin.starts_with(&format!("{}:", host)) {
            return true;
        }
    }
    false
}

/// Bearer 令牌鉴权中间件（常数时间比较）
async fn auth_middleware(
    axum::extract::State(state): axum::extract::State<Arc<ServerState>>,
    req: Request,
    next: Next,
) -> Result<Response, axum::http::StatusCode> {
    // CORS 预检请求直接放行
    if req.method() == Method::OPTIONS {
        return Ok(next.run(req).await);
    }

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token)
            if token.len() == state.token.len()
                && token.as_bytes().ct_eq(state.token.as_bytes()).into() =>
        {
            Ok(next.run(req).await)
        }
        _ => Err(axum::http::StatusCode::UNAUTHORIZED),
    }
}

/// 标记响应来自 surge 守护进程
async fn server_header_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(
        header::HeaderName::from_static("x-surge-server"),
        HeaderValue::from_static("true"),
    );
    resp
}

/// 构建完整路由
pub fn build_router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin, _| {
            origin.to_str().map(check_origin).unwrap_or(false)
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
            Method::PUT,
            Method::PATCH,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-requested-with"),
        ]);

    Router::new()
        .route(
            "/download",
            post(handlers::create_download)
                .get(handlers::get_download)
                .delete(handlers::delete_download),
        )
        .route("/pause", post(handlers::pause_download))
        .route("/pause-all", post(handlers::pause_all))
        .route("/resume", post(handlers::resume_download))
        .route("/list", get(handlers::list_downloads))
        .route("/history", get(handlers::history))
        .route("/events", get(handlers::events))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        // 健康检查不需要鉴权
        .route("/health", get(handlers::health))
        .layer(middleware::from_fn(server_header_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// 读取或生成访问令牌（文件权限 0600）
pub fn ensure_auth_token() -> Result<String> {
    let dir = surge_dir();
    std::fs::create_dir_all(&dir).context("创建配置目录失败")?;
    let token_file = dir.join("token");

    if let Ok(content) = std::fs::read_to_string(&token_file) {
        let token = content.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    let token = Uuid::new_v4().to_string();
    std::fs::write(&token_file, &token).context("写入令牌文件失败")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&token_file, std::fs::Permissions::from_mode(0o600))
            .context("设置令牌文件权限失败")?;
    }
    debug!("已生成新的访问令牌");
    Ok(token)
}

/// 启动守护进程服务
///
/// 绑定本机回环地址的临时端口，端口号写入配置目录的 port 文件
/// 供 CLI 发现；返回实际监听地址
pub async fn serve(
    pool: Arc<WorkerPool>,
    settings: Settings,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<std::net::SocketAddr> {
    let token = ensure_auth_token()?;
    let state = Arc::new(ServerState {
        pool,
        settings,
        token,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("绑定监听地址失败")?;
    let addr = listener.local_addr()?;

    let port_file = surge_dir().join("port");
    std::fs::write(&port_file, addr.port().to_string()).context("写入端口文件失败")?;

    info!("守护进程监听: http://{}", addr);

    let app = build_router(state);
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!("HTTP 服务异常退出: {}", e);
        }
        let _ = std::fs::remove_file(&port_file);
    });

    Ok(addr)
}

/// 读取守护进程端口文件（未运行时返回 None）
pub fn read_active_port() -> Option<u16> {
    let content = std::fs::read_to_string(surge_dir().join("port")).ok()?;
    content.trim().parse().ok()
}
