//! CAS-style single-sign-on provider.
//!
//! The campus CAS server authenticates with a form login that yields a
//! ticket-granting cookie (`CASTGC`); per-service grants come from probing
//! `/login?service=<target>` and harvesting the `ticket=` redirect. Sessions
//! expire silently server-side, which is why the token authority exists.

use super::{IdentityInfo, IdentityProvider, Parameter, ServiceTicket, SessionToken};
use crate::config::CasProviderConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION, SET_COOKIE};
use reqwest::{Client, StatusCode, redirect};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

pub const CAS_TYPE_TAG: &str = "cas_sso";

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

pub struct CasProvider {
    http: Client,
    base_url: String,
    portal_url: String,
}

impl CasProvider {
    pub fn from_config(config: &CasProviderConfig) -> Self {
        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to build CAS HTTP client");

        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            portal_url: config.portal_url.clone(),
        }
    }

    fn login_url(&self, service: &str) -> String {
        format!("{}/login?service={service}", self.base_url)
    }

    async fn probe_ticket(
        &self,
        token: &SessionToken,
        target: &str,
    ) -> Result<ServiceTicket, ProviderError> {
        let cookie = token
            .cookie()
            .ok_or_else(|| ProviderError::rejected("Authorization failed"))?;

        let response = self
            .http
            .get(self.login_url(target))
            .header("Cookie", cookie)
            .send()
            .await?;

        if !response.status().is_redirection() {
            return Err(ProviderError::rejected("Authorization failed"));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ProviderError::rejected("Authorization failed"))?;

        extract_ticket(location)
            .map(|ticket| ServiceTicket { ticket })
            .ok_or_else(|| ProviderError::rejected("Authorization failed"))
    }
}

#[async_trait]
impl IdentityProvider for CasProvider {
    fn type_tag(&self) -> &str {
        CAS_TYPE_TAG
    }

    fn name(&self) -> &str {
        "Campus Single Sign-On"
    }

    fn description(&self) -> &str {
        "Authenticates against the campus CAS server"
    }

    fn login_parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::required("username", "string", "Username")
                .with_description("Your student ID or username."),
            Parameter::required("password", "password", "Password")
                .with_description("Your account password."),
        ]
    }

    async fn get_token_by_params(&self, params: &Value) -> Result<SessionToken, ProviderError> {
        let username = required_str(params, "username")?;
        let password = required_str(params, "password")?;

        // Initial GET primes a fresh login session and carries the form's
        // one-time fields.
        let init = self
            .http
            .get(format!(
                "{}&renew=true",
                self.login_url(&self.portal_url)
            ))
            .send()
            .await?;

        let init_cookies = collect_cookies(init.headers());
        if !init_cookies
            .iter()
            .any(|(name, _)| name.starts_with("JSESSIONIDCAS"))
        {
            return Err(ProviderError::rejected("Remote server error."));
        }
        let init_cookie_header = cookie_header(&init_cookies);

        let body = init.text().await?;
        let (Some(lt), Some(execution)) = (
            extract_form_value(&body, "lt"),
            extract_form_value(&body, "execution"),
        ) else {
            return Err(ProviderError::rejected("Remote server error."));
        };

        let form = [
            ("username", username.to_string()),
            ("password", password.to_string()),
            ("ul", username.len().to_string()),
            ("pl", password.len().to_string()),
            ("lt", lt),
            ("execution", execution),
            ("_eventId", "submit".to_string()),
        ];

        let login = self
            .http
            .post(self.login_url(&self.portal_url))
            .header("Cookie", init_cookie_header)
            .form(&form)
            .send()
            .await?;

        if login.status().is_server_error() {
            return Err(ProviderError::network(format!(
                "CAS login returned {}",
                login.status()
            )));
        }

        let login_cookies: Vec<(String, String)> = collect_cookies(login.headers())
            .into_iter()
            .filter(|(name, _)| name != "Language")
            .collect();

        if !login_cookies
            .iter()
            .any(|(name, _)| name.starts_with("CASTGC"))
        {
            // No ticket-granting cookie: the server rejected the
            // credentials; surface its own message when one is present.
            let body = login.text().await.unwrap_or_default();
            let message =
                extract_error_message(&body).unwrap_or_else(|| "Login Failed.".to_string());
            return Err(ProviderError::Rejected(message));
        }

        Ok(SessionToken::from_cookie(cookie_header(&login_cookies)))
    }

    async fn validate_token(&self, token: &SessionToken) -> Result<(), ProviderError> {
        self.probe_ticket(token, &self.portal_url).await.map(|_| ())
    }

    async fn get_info_by_token(&self, token: &SessionToken) -> Result<IdentityInfo, ProviderError> {
        let grant = self.probe_ticket(token, &self.portal_url).await?;

        let response = self
            .http
            .post(format!("{}/proxyValidate", self.base_url))
            .form(&[
                ("service", self.portal_url.as_str()),
                ("ticket", grant.ticket.as_str()),
            ])
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(ProviderError::network(format!(
                "proxyValidate returned {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        if !body.contains("authenticationSuccess") {
            return Err(ProviderError::rejected("Failed to parse info."));
        }

        let attributes = parse_sso_attributes(&body);

        let mut info = IdentityInfo {
            attributes,
            alias: None,
            unique_id: None,
        };
        if let (Some(user_name), Some(unit_name), Some(id_number)) = (
            info.attributes.get("user_name"),
            info.attributes.get("unit_name"),
            info.attributes.get("id_number"),
        ) {
            info.alias = Some(format!("{user_name} / {unit_name} / {id_number}"));
        }
        info.unique_id = info.attributes.get("user_id").cloned();

        Ok(info)
    }

    async fn authorize_service_by_token(
        &self,
        token: &SessionToken,
        target: &str,
    ) -> Result<ServiceTicket, ProviderError> {
        self.probe_ticket(token, target).await
    }
}

fn required_str<'a>(params: &'a Value, field: &str) -> Result<&'a str, ProviderError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProviderError::rejected(format!("Missing login parameter: {field}")))
}

fn collect_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|raw| {
            let pair = raw.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn cookie_header(cookies: &[(String, String)]) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Pull `value="..."` of the input element carrying `name="<name>"` out of a
/// login form. Good enough for CAS's flat hidden-field markup; this is not
/// an HTML parser.
fn extract_form_value(body: &str, name: &str) -> Option<String> {
    let marker = format!("name=\"{name}\"");
    let at = body.find(&marker)?;

    // the value attribute follows the name attribute within the same tag
    let tail = &body[at + marker.len()..];
    let tag_end = tail.find('>')?;
    let tag = &tail[..tag_end];

    let value_at = tag.find("value=\"")?;
    let rest = &tag[value_at + 7..];
    let end = rest.find('"')?;
    let value = &rest[..end];
    (!value.is_empty()).then(|| value.to_string())
}

fn extract_error_message(body: &str) -> Option<String> {
    let at = body.find("id=\"errormsghide\"")?;
    let tail = &body[at..];
    let open = tail.find('>')?;
    let rest = &tail[open + 1..];
    let close = rest.find('<')?;
    let message = rest[..close].trim();
    (!message.is_empty()).then(|| message.to_string())
}

fn extract_ticket(location: &str) -> Option<String> {
    let at = location.find("ticket=")?;
    let rest = &location[at + 7..];
    let end = rest
        .find(|c| c == '&' || c == '#')
        .unwrap_or(rest.len());
    let ticket = &rest[..end];
    (!ticket.is_empty()).then(|| ticket.to_string())
}

/// Read `<sso:attribute name="..." value="..."/>` pairs from a
/// proxyValidate response.
fn parse_sso_attributes(body: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    let mut rest = body;

    while let Some(at) = rest.find("<sso:attribute ") {
        rest = &rest[at..];
        let Some(tag_end) = rest.find('>') else { break };
        let tag = &rest[..tag_end];

        if let (Some(name), Some(value)) = (attr_value(tag, "name"), attr_value(tag, "value")) {
            attributes.insert(name, value);
        }
        rest = &rest[tag_end..];
    }

    attributes
}

fn attr_value(tag: &str, attr: &str) -> Option<String> {
    let marker = format!("{attr}=\"");
    let at = tag.find(&marker)?;
    let rest = &tag[at + marker.len()..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}
