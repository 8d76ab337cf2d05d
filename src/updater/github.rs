//! GitHub Releases update provider.
//!
//! Fetches the latest release, picks the asset matching the running
//! OS/architecture by scoring asset names, and compares versions with a
//! lenient semver: `v` prefixes, surrounding text and build metadata are
//! tolerated, prerelease identifiers compare per the semver rules, and two
//! unparseable versions fall back to plain inequality.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};

use super::{Provider, UpdateCheck};

const DEFAULT_LATEST_RELEASE_API_URL: &str =
    "https://api.github.com/repos/RangerWolf/loris-tunnel-app/releases/latest";
const DEFAULT_RELEASES_PAGE_URL: &str = "https://github.com/RangerWolf/loris-tunnel-app/releases";
const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GithubReleaseProvider {
    latest_release_api_url: String,
    releases_page_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Default, Deserialize)]
struct LatestRelease {
    #[serde(default)]
    tag_name: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Default, Deserialize)]
struct ReleaseAsset {
    #[serde(default)]
    name: String,
    #[serde(default)]
    browser_download_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

impl GithubReleaseProvider {
    pub fn new() -> Self {
        let api_url = std::env::var("LORIS_TUNNEL_GITHUB_LATEST_RELEASE_API_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_LATEST_RELEASE_API_URL.to_string());
        let page_url = std::env::var("LORIS_TUNNEL_GITHUB_RELEASES_PAGE_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_RELEASES_PAGE_URL.to_string());

        Self {
            latest_release_api_url: api_url,
            releases_page_url: page_url,
            http: reqwest::Client::builder()
                .timeout(API_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    async fn fetch_latest_release(&self) -> Result<LatestRelease> {
        let response = self
            .http
            .get(&self.latest_release_api_url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "loris-tunnel-updater")
            .send()
            .await
            .map_err(|err| Error::network(format!("connect GitHub Releases API failed: {err}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| Error::network(format!("read GitHub response failed: {err}")))?;

        if !status.is_success() {
            if let Ok(payload) = serde_json::from_slice::<ApiError>(&body)
                && !payload.message.trim().is_empty()
            {
                return Err(Error::network(format!(
                    "GitHub API error: {} (HTTP {})",
                    payload.message.trim(),
                    status.as_u16()
                )));
            }
            return Err(Error::network(format!(
                "GitHub API request failed (HTTP {})",
                status.as_u16()
            )));
        }

        serde_json::from_slice(&body)
            .map_err(|err| Error::network(format!("parse GitHub release JSON failed: {err}")))
    }
}

impl Default for GithubReleaseProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for GithubReleaseProvider {
    async fn check(
        &self,
        current_version: &str,
        os_name: &str,
        arch_name: &str,
    ) -> Result<UpdateCheck> {
        let release = self.fetch_latest_release().await?;

        let latest_version = {
            let tag = release.tag_name.trim();
            if tag.is_empty() {
                release.name.trim()
            } else {
                tag
            }
            .to_string()
        };
        if latest_version.is_empty() {
            return Err(Error::network(
                "GitHub release response missing version field (tag_name/name)",
            ));
        }

        let release_page_url = if self.releases_page_url.trim().is_empty() {
            release.html_url.trim().to_string()
        } else {
            self.releases_page_url.trim().to_string()
        };

        Ok(UpdateCheck {
            has_update: is_remote_version_newer(current_version, &latest_version),
            latest_version,
            release_notes: release.body.trim().to_string(),
            download_url: pick_release_download_url(&release, os_name, arch_name),
            release_page_url,
        })
    }
}

fn pick_release_download_url(release: &LatestRelease, os_name: &str, arch_name: &str) -> String {
    let target_os = normalize_target_os(os_name);
    let target_arch = normalize_target_arch(arch_name);

    let mut best_url = "";
    let mut best_score = -1i32;
    for asset in &release.assets {
        if asset.browser_download_url.trim().is_empty() {
            continue;
        }
        let score = score_asset_by_target(&asset.name, &target_os, &target_arch);
        if score > best_score {
            best_score = score;
            best_url = asset.browser_download_url.trim();
        }
    }

    if best_score > 0 && !best_url.is_empty() {
        return best_url.to_string();
    }
    if release.assets.len() == 1 && !release.assets[0].browser_download_url.trim().is_empty() {
        return release.assets[0].browser_download_url.trim().to_string();
    }
    if !release.html_url.trim().is_empty() {
        return release.html_url.trim().to_string();
    }
    release.url.trim().to_string()
}

fn score_asset_by_target(asset_name: &str, os_name: &str, arch_name: &str) -> i32 {
    let name = asset_name.trim().to_lowercase();
    if name.is_empty() {
        return 0;
    }

    let mut score = 0;
    match os_name {
        "mac" => {
            if ["darwin", "mac", "macos", "osx"].iter().any(|t| name.contains(t)) {
                score += 10;
            }
            if [".dmg", ".pkg", ".zip"].iter().any(|ext| name.ends_with(ext)) {
                score += 2;
            }
        }
        "windows" => {
            if ["windows", "win32", "win64", "win"].iter().any(|t| name.contains(t)) {
                score += 10;
            }
            if [".exe", ".msi", ".zip"].iter().any(|ext| name.ends_with(ext)) {
                score += 2;
            }
        }
        "linux" => {
            if name.contains("linux") {
                score += 10;
            }
            if [".appimage", ".deb", ".rpm", ".tar.gz", ".zip"]
                .iter()
                .any(|ext| name.ends_with(ext))
            {
                score += 2;
            }
        }
        _ => {}
    }

    match arch_name {
        "arm64" => {
            if name.contains("arm64") || name.contains("aarch64") {
                score += 6;
            }
        }
        "amd64" => {
            if name.contains("amd64") || name.contains("x86_64") || name.contains("x64") {
                score += 6;
            }
        }
        _ => {}
    }
    score
}

fn normalize_target_os(raw: &str) -> String {
    match raw.trim().to_lowercase().as_str() {
        "darwin" | "mac" | "macos" | "osx" => "mac".to_string(),
        "windows" | "win" => "windows".to_string(),
        "linux" => "linux".to_string(),
        _ => String::new(),
    }
}

fn normalize_target_arch(raw: &str) -> String {
    match raw.trim().to_lowercase().as_str() {
        "arm64" | "aarch64" => "arm64".to_string(),
        "amd64" | "x86_64" | "x64" => "amd64".to_string(),
        _ => String::new(),
    }
}

#[derive(Debug, PartialEq, Eq)]
struct SemVersion {
    major: u64,
    minor: u64,
    patch: u64,
    prerelease: Vec<String>,
}

pub(crate) fn is_remote_version_newer(current_version: &str, remote_version: &str) -> bool {
    let current = normalize_version_input(current_version);
    let remote = normalize_version_input(remote_version);
    if remote.is_empty() {
        return false;
    }
    if current.is_empty() {
        return true;
    }
    if current == remote {
        return false;
    }

    match (parse_semver(&current), parse_semver(&remote)) {
        (Some(current), Some(remote)) => compare_semver(&remote, &current) > 0,
        _ => current != remote,
    }
}

/// Pull a semver-looking token out of arbitrary text ("Release v1.2.3 (st)"
/// yields "v1.2.3"); fall back to the trimmed input.
fn normalize_version_input(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }
    for token in value.split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == ',') {
        if parse_semver(token).is_some() {
            return token.to_string();
        }
    }
    value.to_string()
}

fn parse_semver(raw: &str) -> Option<SemVersion> {
    let mut value = raw.trim();
    if value.is_empty() {
        return None;
    }
    value = value.strip_prefix('v').or_else(|| value.strip_prefix('V')).unwrap_or(value);
    // Build metadata is ignored for ordering.
    if let Some(idx) = value.find('+') {
        value = &value[..idx];
    }

    let (core, prerelease) = match value.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (value, None),
    };

    let mut numbers = core.split('.');
    let major = numbers.next()?.parse::<u64>().ok()?;
    let minor = numbers.next()?.parse::<u64>().ok()?;
    let patch = numbers.next()?.parse::<u64>().ok()?;
    if numbers.next().is_some() {
        return None;
    }

    let prerelease = match prerelease {
        Some(pre) if !pre.trim().is_empty() => {
            let parts: Vec<String> = pre.split('.').map(|s| s.to_string()).collect();
            if parts
                .iter()
                .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
            {
                return None;
            }
            parts
        }
        _ => Vec::new(),
    };

    Some(SemVersion {
        major,
        minor,
        patch,
        prerelease,
    })
}

fn compare_semver(a: &SemVersion, b: &SemVersion) -> i32 {
    if a.major != b.major {
        return if a.major > b.major { 1 } else { -1 };
    }
    if a.minor != b.minor {
        return if a.minor > b.minor { 1 } else { -1 };
    }
    if a.patch != b.patch {
        return if a.patch > b.patch { 1 } else { -1 };
    }

    // A prerelease sorts before its release.
    match (a.prerelease.is_empty(), b.prerelease.is_empty()) {
        (true, true) => return 0,
        (true, false) => return 1,
        (false, true) => return -1,
        (false, false) => {}
    }

    let longest = a.prerelease.len().max(b.prerelease.len());
    for i in 0..longest {
        match (a.prerelease.get(i), b.prerelease.get(i)) {
            (None, Some(_)) => return -1,
            (Some(_), None) => return 1,
            (Some(a_part), Some(b_part)) => {
                let diff = compare_prerelease_identifier(a_part, b_part);
                if diff != 0 {
                    return diff;
                }
            }
            (None, None) => {}
        }
    }
    0
}

fn compare_prerelease_identifier(a: &str, b: &str) -> i32 {
    let a = a.trim();
    let b = b.trim();
    if a == b {
        return 0;
    }

    match (a.parse::<u64>(), b.parse::<u64>()) {
        // Numeric identifiers always compare lower than alphanumeric ones.
        (Ok(a_num), Ok(b_num)) => {
            if a_num > b_num {
                1
            } else {
                -1
            }
        }
        (Ok(_), Err(_)) => -1,
        (Err(_), Ok(_)) => 1,
        (Err(_), Err(_)) => {
            if a > b {
                1
            } else {
                -1
            }
        }
    }
}
