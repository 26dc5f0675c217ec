//! 下载引擎端到端测试
//!
//! 对进程内模拟源站执行真实下载：成功、暂停恢复、快速失败、
//! 镜像切换与工作窃取

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use common::{
    deterministic_bytes, sha256_hex, spawn_origin, test_pool, test_settings, wait_for_downloaded,
    wait_for_status, OriginConfig,
};
use surge::config::MB;
use surge::engine::{build_client, ConcurrentDownloader, ProgressState};
use surge::pool::Event;
use surge::state::DownloadStatus;

/// E1: 10 MiB 确定性内容，完整下载后逐字节一致
#[tokio::test(flavor = "multi_thread")]
async fn test_e1_download_success() {
    let data = deterministic_bytes(10 * MB as usize, 0x5eed);
    let origin_sha = sha256_hex(&data);
    let origin = spawn_origin(OriginConfig::new(data)).await;

    let dir = tempfile::tempdir().unwrap();
    let (pool, store) = test_pool(test_settings(dir.path()), dir.path());

    let id = pool
        .add(
            &origin.url(),
            dir.path(),
            Some("out.bin".to_string()),
            Vec::new(),
            HashMap::new(),
        )
        .await
        .unwrap();

    // 5 秒内进入下载（快速完成时直接到 completed 也算通过）
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = pool.get_status(&id).unwrap().status;
        if matches!(status, DownloadStatus::Downloading | DownloadStatus::Completed) {
            break;
        }
        assert!(Instant::now() < deadline, "5 秒内未开始下载");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(
        wait_for_status(&pool, &id, DownloadStatus::Completed, Duration::from_secs(30)).await,
        "30 秒内未完成下载"
    );

    let final_path = dir.path().join("out.bin");
    let content = std::fs::read(&final_path).unwrap();
    assert_eq!(content.len(), 10 * MB as usize);
    assert_eq!(sha256_hex(&content), origin_sha);

    // 部分文件已改名，残留任务已清空
    assert!(!dir.path().join("out.bin.surge").exists());
    assert!(store
        .load_state(&origin.url(), &final_path.to_string_lossy())
        .unwrap()
        .is_none());

    let entry = store.get_entry(&id).unwrap().unwrap();
    assert_eq!(entry.status, DownloadStatus::Completed);
    assert_eq!(entry.downloaded, 10 * MB);
    assert!(entry.completed_at.is_some());
}

/// E2: 下载中途暂停，残留区间落库，恢复后内容完整
#[tokio::test(flavor = "multi_thread")]
async fn test_e2_pause_resume() {
    let data = deterministic_bytes(20 * MB as usize, 0xabcd);
    let origin_sha = sha256_hex(&data);
    let mut cfg = OriginConfig::new(data);
    cfg.chunk_delay = Duration::from_millis(30);
    let origin = spawn_origin(cfg).await;

    let dir = tempfile::tempdir().unwrap();
    let (pool, store) = test_pool(test_settings(dir.path()), dir.path());

    let id = pool
        .add(
            &origin.url(),
            dir.path(),
            Some("out.bin".to_string()),
            Vec::new(),
            HashMap::new(),
        )
        .await
        .unwrap();

    assert!(
        wait_for_downloaded(&pool, &id, MB, Duration::from_secs(15)).await,
        "未能下载超过 1 MiB"
    );
    pool.pause(&id).unwrap();

    assert!(
        wait_for_status(&pool, &id, DownloadStatus::Paused, Duration::from_secs(2)).await,
        "2 秒内未进入暂停状态"
    );

    // 残留任务与 downloaded 对账
    let dest = dir.path().join("out.bin");
    let saved = store
        .load_state(&origin.url(), &dest.to_string_lossy())
        .unwrap()
        .expect("暂停后应有断点状态");
    assert!(!saved.tasks.is_empty(), "应有残留任务");
    let residual: u64 = saved.tasks.iter().map(|t| t.length).sum();
    assert_eq!(saved.entry.downloaded + residual, 20 * MB);
    assert!(saved.entry.downloaded > 0);

    // 恢复并等待完成
    pool.resume(&id).unwrap();
    assert!(
        wait_for_status(&pool, &id, DownloadStatus::Completed, Duration::from_secs(90)).await,
        "恢复后未完成"
    );

    let content = std::fs::read(&dest).unwrap();
    assert_eq!(sha256_hex(&content), origin_sha);
}

/// E3: 源站恒定 404，立即失败不重试
#[tokio::test(flavor = "multi_thread")]
async fn test_e3_not_found_fails_fast() {
    let mut cfg = OriginConfig::new(deterministic_bytes(MB as usize, 1));
    cfg.force_status = Some(404);
    let origin = spawn_origin(cfg).await;

    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.performance.max_task_retries = 2;
    let (pool, _store) = test_pool(settings, dir.path());

    let mut events = pool.subscribe();
    let started = Instant::now();
    let id = pool
        .add(&origin.url(), dir.path(), None, Vec::new(), HashMap::new())
        .await
        .unwrap();

    assert!(
        wait_for_status(&pool, &id, DownloadStatus::Error, Duration::from_millis(1500)).await,
        "1.5 秒内未失败"
    );
    assert!(started.elapsed() < Duration::from_millis(1500));

    // 错误事件类别为致命
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(Event::Error { kind, .. })) => {
                assert_eq!(kind, "fatal");
                break;
            }
            Ok(Ok(_)) => {}
            _ => assert!(Instant::now() < deadline, "未收到错误事件"),
        }
    }
}

/// E4: 主源全部 Range 请求返回 500，镜像正常，走镜像完成
#[tokio::test(flavor = "multi_thread")]
async fn test_e4_mirror_failover() {
    let data = deterministic_bytes(4 * MB as usize, 0x44);
    let origin_sha = sha256_hex(&data);

    let mut primary_cfg = OriginConfig::new(data.clone());
    primary_cfg.range_status = Some(500);
    let primary = spawn_origin(primary_cfg).await;
    let mirror = spawn_origin(OriginConfig::new(data)).await;

    let dir = tempfile::tempdir().unwrap();
    let (pool, _store) = test_pool(test_settings(dir.path()), dir.path());

    let id = pool
        .add(
            &primary.url(),
            dir.path(),
            Some("out.bin".to_string()),
            vec![mirror.url()],
            HashMap::new(),
        )
        .await
        .unwrap();

    assert!(
        wait_for_status(&pool, &id, DownloadStatus::Completed, Duration::from_secs(30)).await,
        "镜像切换后未完成"
    );

    let content = std::fs::read(dir.path().join("out.bin")).unwrap();
    assert_eq!(sha256_hex(&content), origin_sha);

    // 实际数据全部来自镜像
    assert!(mirror.range_hits.load(std::sync::atomic::Ordering::SeqCst) > 0);
}

/// E5: 一个连接人为限速，窃取把它的尾段分给空闲协程
#[tokio::test(flavor = "multi_thread")]
async fn test_e5_work_stealing() {
    let data = deterministic_bytes(8 * MB as usize, 0x55);
    let origin_sha = sha256_hex(&data);
    let mut cfg = OriginConfig::new(data);
    // 偏移 0 起始的区间按 300ms/64KiB 爬行，独立完成要 10 秒以上
    cfg.slow_head_range = Some(Duration::from_millis(300));
    let origin = spawn_origin(cfg).await;

    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.chunks.min_chunk_size = 128 * 1024;
    let (pool, _store) = test_pool(settings, dir.path());

    let started = Instant::now();
    let id = pool
        .add(
            &origin.url(),
            dir.path(),
            Some("out.bin".to_string()),
            Vec::new(),
            HashMap::new(),
        )
        .await
        .unwrap();

    assert!(
        wait_for_status(&pool, &id, DownloadStatus::Completed, Duration::from_secs(20)).await,
        "窃取未能拯救慢连接"
    );
    // 没有窃取时慢连接独自要 10 秒以上
    assert!(started.elapsed() < Duration::from_secs(15));

    let content = std::fs::read(dir.path().join("out.bin")).unwrap();
    assert_eq!(sha256_hex(&content), origin_sha);

    // 窃取产生了超出初始分片数的额外 Range 请求
    // （8 MiB / 3 连接 = 3 个初始分片 + 1 次探测）
    let range_requests = origin.range_hits.load(std::sync::atomic::Ordering::SeqCst);
    assert!(
        range_requests > 4,
        "预期窃取产生额外 Range 请求，实际 {}",
        range_requests
    );
}

/// 不支持 Range 的源站回退到单连接，内容仍完整
#[tokio::test(flavor = "multi_thread")]
async fn test_single_stream_fallback() {
    let data = deterministic_bytes(2 * MB as usize, 0x77);
    let origin_sha = sha256_hex(&data);
    let mut cfg = OriginConfig::new(data);
    cfg.support_ranges = false;
    let origin = spawn_origin(cfg).await;

    let dir = tempfile::tempdir().unwrap();
    let (pool, _store) = test_pool(test_settings(dir.path()), dir.path());

    let id = pool
        .add(
            &origin.url(),
            dir.path(),
            Some("plain.bin".to_string()),
            Vec::new(),
            HashMap::new(),
        )
        .await
        .unwrap();

    assert!(
        wait_for_status(&pool, &id, DownloadStatus::Completed, Duration::from_secs(30)).await,
        "单连接回退未完成"
    );

    let content = std::fs::read(dir.path().join("plain.bin")).unwrap();
    assert_eq!(sha256_hex(&content), origin_sha);
}

/// 不变式：任意时刻 残留区间总长 + downloaded 与总大小的差
/// 不超过在途读缓冲
#[tokio::test(flavor = "multi_thread")]
async fn test_residual_accounting_invariant() {
    std::env::set_var("SURGE_ALLOW_PRIVATE_IPS", "true");
    let total = 6 * MB;
    let data = deterministic_bytes(total as usize, 0x99);
    let mut cfg = OriginConfig::new(data);
    cfg.chunk_delay = Duration::from_millis(10);
    let origin = spawn_origin(cfg).await;

    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let buffer_slack =
        settings.chunks.worker_buffer_size * settings.connections.max_connections_per_host as u64;

    let state = Arc::new(ProgressState::new("inv-test", total));
    let client = build_client(&settings).unwrap();
    let downloader = Arc::new(ConcurrentDownloader::new(
        "inv-test",
        client,
        Some(state.clone()),
        settings,
        HashMap::new(),
    ));

    let dest = dir.path().join("inv.bin");
    let dl = downloader.clone();
    let url = origin.url();
    let dest_clone = dest.clone();
    let handle = tokio::spawn(async move {
        dl.download(CancellationToken::new(), vec![url], &dest_clone, total, None)
            .await
    });

    // 快照非原子：正在出队/入册的任务最多造成一个分片的瞬时偏差
    let chunk_slack = state.actual_chunk_size().max(2 * MB);
    let slack = buffer_slack + chunk_slack;
    let mut prev_downloaded = 0u64;
    while !handle.is_finished() {
        let residual: u64 = downloader.residual_snapshot().iter().map(|t| t.length).sum();
        let downloaded = state.downloaded();

        // downloaded 只增不减
        assert!(downloaded >= prev_downloaded, "downloaded 出现回退");
        prev_downloaded = downloaded;

        let accounted = residual + downloaded;
        assert!(
            accounted <= total + slack && accounted + slack >= total,
            "记账偏差过大: 残留 {} + 已下载 {} vs 总量 {}",
            residual,
            downloaded,
            total
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    handle.await.unwrap().unwrap();
    assert_eq!(state.downloaded(), total);
    assert_eq!(std::fs::read(&dest).unwrap().len() as u64, total);
}
