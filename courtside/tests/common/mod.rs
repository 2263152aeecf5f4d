#![allow(dead_code)]

use axum::Router;
use std::time::Duration;
use tokio::net::TcpListener;

/// 在随机端口上启动假后端，返回 base url
pub async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// 一个没有进程监听的地址
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub const FAST: Duration = Duration::from_millis(20);
