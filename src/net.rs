//! 网络安全检查
//!
//! 下载前对目标主机做 SSRF 防护：解析主机名并拒绝落在
//! 私有网段的地址，避免浏览器扩展诱导守护进程访问内网服务

use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use tracing::warn;
use url::Url;

use crate::utils::sanitize_url;

/// 测试环境覆盖开关：允许访问私有地址
pub const ALLOW_PRIVATE_IPS_ENV: &str = "SURGE_ALLOW_PRIVATE_IPS";

/// 判断 IP 是否属于私有/保留网段
///
/// 覆盖范围：回环、链路本地、组播链路本地、未指定地址、
/// RFC1918、IPv6 ULA（fc00::/7）
pub fn is_private_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() {
        return true;
    }

    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            // fe80::/10 链路本地
            let segs = v6.segments();
            if segs[0] & 0xffc0 == 0xfe80 {
                return true;
            }
            // fc00::/7 唯一本地地址
            if segs[0] & 0xfe00 == 0xfc00 {
                return true;
            }
            // IPv4 映射地址按 IPv4 规则判断
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(v4));
            }
            false
        }
    }
}

/// 是否允许访问私有地址（由环境变量控制，测试环境使用）
pub fn private_ips_allowed() -> bool {
    std::env::var(ALLOW_PRIVATE_IPS_ENV)
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// 校验下载 URL 的目标主机
///
/// 解析主机名的所有地址，全部落在私有网段时拒绝。
/// 字面量 IP 直接判断，域名走 DNS 解析
pub async fn check_url_allowed(raw_url: &str) -> Result<()> {
    let u = Url::parse(raw_url).with_context(|| format!("URL 解析失败: {}", sanitize_url(raw_url)))?;

    match u.scheme() {
        "http" | "https" => {}
        other => bail!("不支持的 URL 协议: {}", other),
    }

    let host = u
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("URL 缺少主机名: {}", sanitize_url(raw_url)))?;

    if private_ips_allowed() {
        return Ok(());
    }

    // 字面量 IP 不需要 DNS 解析
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        if is_private_ip(ip) {
            warn!("安全拦截: 目标地址位于私有网段: {}", ip);
            bail!("安全拦截: 禁止访问私有地址 {}", ip);
        }
        return Ok(());
    }

    let port = u.port_or_known_default().unwrap_or(443);
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("DNS 解析失败: {}", host))?
        .map(|sa| sa.ip())
        .collect();

    if addrs.is_empty() {
        bail!("DNS 解析无结果: {}", host);
    }

    if addrs.iter().all(|ip| is_private_ip(*ip)) {
        warn!("安全拦截: 主机 {} 的全部解析结果均为私有地址", host);
        bail!("安全拦截: 禁止访问主机 {} 的私有地址", host);
    }

    Ok(())
}
