//! 网盘路径工具
//!
//! OneDrive 路径统一使用 POSIX 风格、不带首尾斜杠的形式（根目录为空串）。

use std::path::Path;

/// 规范化网盘路径
///
/// - 反斜杠转为正斜杠
/// - 去掉空段和 `.` 段，处理 `..`
/// - 去掉首尾斜杠
pub fn normalize_remote_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// 拼接网盘目录和名称
pub fn join_remote(dir: &str, name: &str) -> String {
    let dir = normalize_remote_path(dir);
    let name = normalize_remote_path(name);
    match (dir.is_empty(), name.is_empty()) {
        (true, _) => name,
        (false, true) => dir,
        (false, false) => format!("{}/{}", dir, name),
    }
}

/// 网盘路径的父目录（根目录的父目录仍为根目录）
pub fn remote_parent(path: &str) -> String {
    let path = normalize_remote_path(path);
    match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

/// 网盘路径的最后一段
pub fn remote_basename(path: &str) -> String {
    let path = normalize_remote_path(path);
    match path.rsplit_once('/') {
        Some((_, name)) => name.to_string(),
        None => path,
    }
}

/// 本地相对路径转网盘路径（Windows 分隔符转换）
pub fn local_to_remote(relative: &Path) -> String {
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    normalize_remote_path(&joined)
}

/// 从 URL 中移除指定查询参数（日志输出前去掉 access_token 等敏感信息）
pub fn strip_query_param(url: &str, name: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some(pair) => pair,
        None => return url.to_string(),
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            !key.is_empty() && key != name
        })
        .collect();

    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_normalize_remote_path() {
        assert_eq!(normalize_remote_path("/Documents/"), "Documents");
        assert_eq!(normalize_remote_path("a//b/./c"), "a/b/c");
        assert_eq!(normalize_remote_path("a/b/../c"), "a/c");
        assert_eq!(normalize_remote_path("a\\b"), "a/b");
        assert_eq!(normalize_remote_path("/"), "");
    }

    #[test]
    fn test_join_and_split() {
        assert_eq!(join_remote("/backup/", "file.bin"), "backup/file.bin");
        assert_eq!(join_remote("", "file.bin"), "file.bin");
        assert_eq!(remote_parent("backup/2024/file.bin"), "backup/2024");
        assert_eq!(remote_parent("file.bin"), "");
        assert_eq!(remote_basename("backup/2024/file.bin"), "file.bin");
    }

    #[test]
    fn test_local_to_remote() {
        let relative = PathBuf::from("photos").join("2024").join("a.jpg");
        assert_eq!(local_to_remote(&relative), "photos/2024/a.jpg");
    }

    #[test]
    fn test_strip_query_param() {
        assert_eq!(
            strip_query_param("http://example.com?access_token=142857", "access_token"),
            "http://example.com"
        );
        assert_eq!(
            strip_query_param("https://up.example/s?a=1&access_token=x&b=2", "access_token"),
            "https://up.example/s?a=1&b=2"
        );
        assert_eq!(strip_query_param("https://up.example/s", "access_token"), "https://up.example/s");
    }
}
