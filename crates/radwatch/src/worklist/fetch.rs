//! Page sources: live login-and-fetch over HTTP, or a saved page on disk.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use scraper::{Html, Selector};

use super::types::FetchedPage;
use crate::config::SourceConfig;
use crate::error::{MonitorError, Result};

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) radwatch";

/// Markers that only appear on pages served to a logged-in session.
const LOGGED_IN_MARKERS: [&str; 2] = ["Logout", "Worklist"];

const USERNAME_FIELDS: [&str; 6] = [
    "username",
    "user",
    "userid",
    "login",
    "txtusername",
    "ctl00$maincontent$txtusername",
];
const PASSWORD_FIELDS: [&str; 5] = [
    "password",
    "pwd",
    "pass",
    "txtpassword",
    "ctl00$maincontent$txtpassword",
];

/// Something that can produce the worklist page for one cycle.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch the page. Failures map to [`MonitorError::Fetch`].
    async fn fetch(&self) -> Result<FetchedPage>;
}

/// Replays a saved page (and optional screenshot) from disk.
pub struct FileSource {
    html_path: PathBuf,
    screenshot_path: Option<PathBuf>,
}

impl FileSource {
    #[must_use]
    pub fn new(html_path: PathBuf) -> Self {
        Self {
            html_path,
            screenshot_path: None,
        }
    }

    #[must_use]
    pub fn with_screenshot(mut self, path: PathBuf) -> Self {
        self.screenshot_path = Some(path);
        self
    }
}

#[async_trait]
impl PageSource for FileSource {
    async fn fetch(&self) -> Result<FetchedPage> {
        let html = tokio::fs::read_to_string(&self.html_path)
            .await
            .map_err(|e| {
                MonitorError::Fetch(format!("read {}: {e}", self.html_path.display()))
            })?;

        let screenshot = match &self.screenshot_path {
            Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
                MonitorError::Fetch(format!("read {}: {e}", path.display()))
            })?),
            None => None,
        };

        Ok(FetchedPage {
            html,
            screenshot,
            source: self.html_path.display().to_string(),
        })
    }
}

/// A login form found on a page, with credentials filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginForm {
    /// Raw `action` attribute (may be relative or empty).
    pub action: String,
    pub fields: Vec<(String, String)>,
}

/// Find the first form with a password input and fill it.
///
/// Every named input keeps its value (ASP.NET view state and friends), then
/// the username/password fields are chosen by well-known names, falling back
/// to the first user-ish text input and the first password input.
#[must_use]
pub fn extract_login_form(html: &str, username: &str, password: &str) -> Option<LoginForm> {
    let document = Html::parse_document(html);
    let form_selector = Selector::parse("form").expect("Invalid form selector");
    let input_selector = Selector::parse("input").expect("Invalid input selector");
    let password_selector =
        Selector::parse("input[type='password' i]").expect("Invalid password selector");

    let form = document
        .select(&form_selector)
        .find(|f| f.select(&password_selector).next().is_some())?;

    let inputs: Vec<_> = form.select(&input_selector).collect();
    let mut fields: Vec<(String, String)> = inputs
        .iter()
        .filter_map(|i| {
            let name = i.value().attr("name")?;
            Some((
                name.to_string(),
                i.value().attr("value").unwrap_or_default().to_string(),
            ))
        })
        .collect();

    let mut set_by_name = |candidates: &[&str], value: &str| {
        let mut set = false;
        for (name, v) in &mut fields {
            if candidates.contains(&name.to_ascii_lowercase().as_str()) {
                *v = value.to_string();
                set = true;
            }
        }
        set
    };
    let user_set = set_by_name(&USERNAME_FIELDS, username);
    let pass_set = set_by_name(&PASSWORD_FIELDS, password);

    let input_type = |i: &scraper::ElementRef<'_>| {
        i.value()
            .attr("type")
            .unwrap_or("text")
            .to_ascii_lowercase()
    };

    if !user_set {
        let guess = inputs.iter().find_map(|i| {
            let name = i.value().attr("name")?;
            let lower = name.to_ascii_lowercase();
            (matches!(input_type(i).as_str(), "text" | "email")
                && (lower.contains("user") || lower.contains("login")))
            .then(|| name.to_string())
        });
        if let Some(name) = guess {
            set_field(&mut fields, &name, username);
        }
    }
    if !pass_set {
        let guess = inputs.iter().find_map(|i| {
            (input_type(i) == "password")
                .then(|| i.value().attr("name").map(str::to_string))
                .flatten()
        });
        if let Some(name) = guess {
            set_field(&mut fields, &name, password);
        }
    }

    Some(LoginForm {
        action: form.value().attr("action").unwrap_or_default().to_string(),
        fields,
    })
}

fn set_field(fields: &mut [(String, String)], name: &str, value: &str) {
    for (n, v) in fields.iter_mut() {
        if n == name {
            *v = value.to_string();
        }
    }
}

fn is_logged_in(html: &str) -> bool {
    LOGGED_IN_MARKERS.iter().any(|m| html.contains(m))
}

/// Logs in with a cookie session and fetches the worklist page.
///
/// Each configured base URL is tried in order; the first that yields a
/// page wins. Every request is bounded by the configured timeout.
pub struct HttpSource {
    config: SourceConfig,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        if config.base_urls.is_empty() {
            return Err(MonitorError::Config("source.base_urls is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MonitorError::Fetch(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    async fn get_text(&self, url: &Url) -> std::result::Result<String, String> {
        tracing::debug!(url = %url, "GET");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.to_string())?;
        response.text().await.map_err(|e| e.to_string())
    }

    async fn fetch_from(&self, base: &str) -> std::result::Result<String, String> {
        let base = Url::parse(&format!("{}/", base.trim_end_matches('/')))
            .map_err(|e| format!("invalid base url {base}: {e}"))?;
        let index_url = base
            .join(&self.config.index_path)
            .map_err(|e| e.to_string())?;
        let worklist_url = base
            .join(&self.config.worklist_path)
            .map_err(|e| e.to_string())?;

        let index = self.get_text(&index_url).await?;
        if is_logged_in(&index) {
            tracing::debug!("Session already authenticated");
            return self.get_text(&worklist_url).await;
        }

        let (form, form_page_url) =
            match extract_login_form(&index, &self.config.username, &self.config.password) {
                Some(form) => (form, index_url),
                None => {
                    // Some deployments redirect the worklist itself to the login page.
                    let page = self.get_text(&worklist_url).await?;
                    if is_logged_in(&page) {
                        return Ok(page);
                    }
                    let form = extract_login_form(
                        &page,
                        &self.config.username,
                        &self.config.password,
                    )
                    .ok_or_else(|| "no login form found".to_string())?;
                    (form, worklist_url.clone())
                }
            };

        let post_url = if form.action.is_empty() {
            form_page_url
        } else {
            form_page_url
                .join(&form.action)
                .map_err(|e| format!("invalid form action {}: {e}", form.action))?
        };

        tracing::info!(url = %post_url, "Submitting login form");
        self.client
            .post(post_url)
            .form(&form.fields)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.to_string())?;

        self.get_text(&worklist_url).await
    }
}

#[async_trait]
impl PageSource for HttpSource {
    async fn fetch(&self) -> Result<FetchedPage> {
        if self.config.username.is_empty() || self.config.password.is_empty() {
            tracing::warn!("Worklist credentials are empty; login will likely fail");
        }

        let mut last_error = String::new();
        for base in &self.config.base_urls {
            match self.fetch_from(base).await {
                Ok(html) => {
                    tracing::info!(base = %base, bytes = html.len(), "Fetched worklist page");
                    return Ok(FetchedPage {
                        html,
                        screenshot: None,
                        source: base.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!(base = %base, error = %e, "Worklist fetch failed");
                    last_error = format!("{base}: {e}");
                }
            }
        }

        Err(MonitorError::Fetch(format!(
            "failed to login/fetch worklist; last error: {last_error}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_login_form_known_names() {
        let html = r#"
            <form action="Index.aspx" method="post">
              <input type="hidden" name="__VIEWSTATE" value="abc">
              <input type="text" name="ctl00$MainContent$txtUserName">
              <input type="password" name="ctl00$MainContent$txtPassword">
              <input type="submit" name="btnLogin" value="Log In">
            </form>"#;

        let form = extract_login_form(html, "reed", "s3cret").unwrap();
        assert_eq!(form.action, "Index.aspx");
        assert_eq!(
            form.fields,
            vec![
                ("__VIEWSTATE".to_string(), "abc".to_string()),
                ("ctl00$MainContent$txtUserName".to_string(), "reed".to_string()),
                ("ctl00$MainContent$txtPassword".to_string(), "s3cret".to_string()),
                ("btnLogin".to_string(), "Log In".to_string()),
            ]
        );
    }

    #[test]
    fn test_extract_login_form_heuristic_names() {
        let html = r#"
            <form id="search"><input type="text" name="q"></form>
            <form>
              <input type="email" name="LoginEmail">
              <input type="PASSWORD" name="secretField">
            </form>"#;

        let form = extract_login_form(html, "reed", "s3cret").unwrap();
        assert_eq!(form.action, "");
        assert!(form
            .fields
            .contains(&("LoginEmail".to_string(), "reed".to_string())));
        assert!(form
            .fields
            .contains(&("secretField".to_string(), "s3cret".to_string())));
    }

    #[test]
    fn test_extract_login_form_none_without_password_input() {
        assert!(extract_login_form("<form><input name='q'></form>", "u", "p").is_none());
    }

    #[tokio::test]
    async fn test_file_source_missing_file_is_fetch_error() {
        let source = FileSource::new(PathBuf::from("/nonexistent/radwatch/page.html"));
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, MonitorError::Fetch(_)));
    }

    #[test]
    fn test_http_source_requires_base_url() {
        let config = SourceConfig {
            base_urls: vec![],
            ..SourceConfig::default()
        };
        assert!(matches!(
            HttpSource::new(config),
            Err(MonitorError::Config(_))
        ));
    }
}
