use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io;
use std::{fs::File, path::Path};

/// 格式化字节大小为易读的字符串
pub fn format_size(size: u64) -> String {
    if size == 0 {
        return "0.00 B".to_string();
    }

    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut size = size as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", size, UNITS[unit])
}

/// 字节数换算为 MB，保留两位小数的字符串（分块上传表单字段）
pub fn size_in_mb(size: u64) -> String {
    format!("{:.2}", size as f64 / (1024.0 * 1024.0))
}

/// 计算指定文件的 SHA-256，返回小写十六进制
pub fn calc_sha256(path: &Path) -> Result<String> {
    let mut input = File::open(path)
        .with_context(|| format!("打开文件 '{}' 失败用于计算 SHA-256", path.display()))?;

    let mut hasher = Sha256::new();

    io::copy(&mut input, &mut hasher)
        .with_context(|| format!("读取文件 '{}' 内容失败用于计算 SHA-256", path.display()))?;

    Ok(hex::encode(hasher.finalize()))
}

/// 比较两个十六进制摘要，忽略大小写与首尾空白
pub fn digest_eq(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
