//! Autenticación: basic (usuario/contraseña de config) u OIDC (JWT bearer).
//!
//! Sin credenciales -> 401; credenciales incorrectas -> 403.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use common::config::{BasicCredential, OidcConfig, ServerConfig};

use crate::error::ApiError;

/// Rutas que no piden credenciales.
const PUBLIC_PATHS: &[&str] = &["/health", "/v1/tasks/service-info", "/v1/service-info"];

/// Intervalo mínimo entre descargas del JWKS.
const JWKS_MIN_REFRESH: Duration = Duration::from_secs(15 * 60);

const INTROSPECTION_ATTEMPTS: u32 = 3;

#[derive(Default)]
pub struct Auth {
    basic: Vec<BasicCredential>,
    oidc: Option<OidcVerifier>,
}

impl Auth {
    pub fn from_config(conf: &ServerConfig) -> Self {
        let oidc = conf.oidc.enabled().then(|| OidcVerifier::new(conf.oidc.clone()));
        Auth {
            basic: conf.basic_auth.clone(),
            oidc,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.basic.is_empty() || self.oidc.is_some()
    }

    /// Valida la cabecera `Authorization` de una petición.
    pub async fn check(&self, header: Option<&str>) -> Result<(), ApiError> {
        if !self.enabled() {
            return Ok(());
        }
        let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) else {
            return Err(ApiError::unauthorized("missing credentials"));
        };

        if let Some(encoded) = strip_scheme(header, "Basic") {
            return self.check_basic(encoded);
        }
        if let Some(token) = strip_scheme(header, "Bearer") {
            return match &self.oidc {
                Some(oidc) => oidc.verify(token).await,
                None => Err(ApiError::forbidden("bearer tokens are not accepted")),
            };
        }
        Err(ApiError::unauthorized("unsupported authorization scheme"))
    }

    fn check_basic(&self, encoded: &str) -> Result<(), ApiError> {
        if self.basic.is_empty() {
            return Err(ApiError::forbidden("basic credentials are not accepted"));
        }
        let decoded = STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or_else(|| ApiError::unauthorized("malformed basic credentials"))?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| ApiError::unauthorized("malformed basic credentials"))?;

        if self
            .basic
            .iter()
            .any(|c| c.user == user && c.password == password)
        {
            Ok(())
        } else {
            Err(ApiError::forbidden("invalid credentials"))
        }
    }
}

fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let (s, rest) = header.split_once(' ')?;
    s.eq_ignore_ascii_case(scheme).then_some(rest.trim())
}

/// Middleware de axum que aplica `Auth` a todo salvo las rutas públicas.
pub async fn require_auth(State(auth): State<Arc<Auth>>, req: Request, next: Next) -> Response {
    if PUBLIC_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    match auth.check(header).await {
        Ok(()) => next.run(req).await,
        Err(e) => {
            debug!("petición rechazada en {}: {}", req.uri().path(), e);
            e.into_response()
        }
    }
}

/* ---------------- OIDC ---------------- */

struct CachedJwks {
    set: Arc<JwkSet>,
    fetched_at: Instant,
}

pub struct OidcVerifier {
    conf: OidcConfig,
    jwks: RwLock<Option<CachedJwks>>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct Introspection {
    #[serde(default)]
    active: bool,
}

impl OidcVerifier {
    pub fn new(conf: OidcConfig) -> Self {
        let http = match reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!("no se pudo configurar el cliente http de OIDC: {e}");
                reqwest::Client::new()
            }
        };
        OidcVerifier {
            conf,
            jwks: RwLock::new(None),
            http,
        }
    }

    pub async fn verify(&self, token: &str) -> Result<(), ApiError> {
        let header = decode_header(token).map_err(|_| ApiError::forbidden("invalid token"))?;
        let kid = header
            .kid
            .ok_or_else(|| ApiError::forbidden("token without key id"))?;
        if !matches!(header.alg, Algorithm::RS256 | Algorithm::ES256) {
            return Err(ApiError::forbidden("unsupported token algorithm"));
        }

        let jwk = self
            .jwk(&kid)
            .await
            .ok_or_else(|| ApiError::forbidden("unknown signing key"))?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|_| ApiError::forbidden("invalid signing key"))?;

        let claims = decode::<Value>(token, &key, &self.validation(header.alg))
            .map(|t| t.claims)
            .map_err(|e| ApiError::forbidden(format!("invalid token: {e}")))?;
        check_scopes(&claims, &self.conf.required_scopes)?;

        if !self.conf.introspection_url.is_empty() {
            self.introspect(token).await?;
        }
        Ok(())
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut v = Validation::new(alg);
        v.algorithms = vec![Algorithm::RS256, Algorithm::ES256];
        if self.conf.audience.is_empty() {
            v.validate_aud = false;
        } else {
            v.set_audience(&self.conf.audience);
        }
        if !self.conf.issuer.is_empty() {
            v.set_issuer(&[self.conf.issuer.as_str()]);
        }
        v
    }

    async fn jwk(&self, kid: &str) -> Option<Jwk> {
        let stale = {
            let cache = self.jwks.read().await;
            match cache.as_ref() {
                Some(c) => {
                    if let Some(k) = c.set.find(kid) {
                        return Some(k.clone());
                    }
                    // kid desconocido: solo se vuelve a pedir si pasó el intervalo mínimo
                    c.fetched_at.elapsed() >= JWKS_MIN_REFRESH
                }
                None => true,
            }
        };
        if !stale {
            return None;
        }
        if let Err(e) = self.refresh().await {
            warn!("no se pudo descargar el JWKS: {e}");
            self.mark_failed_fetch().await;
        }
        let cache = self.jwks.read().await;
        cache.as_ref().and_then(|c| c.set.find(kid).cloned())
    }

    async fn refresh(&self) -> Result<(), reqwest::Error> {
        let set = self
            .http
            .get(&self.conf.jwks_url)
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await?;
        debug!("JWKS actualizado: {} claves", set.keys.len());
        *self.jwks.write().await = Some(CachedJwks {
            set: Arc::new(set),
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    /// Un fallo también cuenta para el intervalo mínimo; se conservan las
    /// claves que hubiera.
    async fn mark_failed_fetch(&self) {
        let mut cache = self.jwks.write().await;
        match cache.as_mut() {
            Some(c) => c.fetched_at = Instant::now(),
            None => {
                *cache = Some(CachedJwks {
                    set: Arc::new(JwkSet { keys: Vec::new() }),
                    fetched_at: Instant::now(),
                })
            }
        }
    }

    async fn introspect(&self, token: &str) -> Result<(), ApiError> {
        let mut last = String::new();
        for attempt in 0..INTROSPECTION_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt - 1))).await;
            }
            let mut req = self
                .http
                .post(&self.conf.introspection_url)
                .form(&[("token", token)]);
            if !self.conf.client_id.is_empty() {
                req = req.basic_auth(&self.conf.client_id, Some(&self.conf.client_secret));
            }
            let resp = match req.send().await.and_then(|r| r.error_for_status()) {
                Ok(r) => r,
                Err(e) => {
                    last = e.to_string();
                    continue;
                }
            };
            return match resp.json::<Introspection>().await {
                Ok(i) if i.active => Ok(()),
                Ok(_) => Err(ApiError::forbidden("token is not active")),
                Err(e) => Err(ApiError::forbidden(format!("bad introspection response: {e}"))),
            };
        }
        warn!("introspección fallida tras {INTROSPECTION_ATTEMPTS} intentos: {last}");
        Err(ApiError::forbidden("token introspection failed"))
    }
}

/// El claim `scope` es una lista separada por espacios.
fn check_scopes(claims: &Value, required: &[String]) -> Result<(), ApiError> {
    if required.is_empty() {
        return Ok(());
    }
    let granted: Vec<&str> = claims
        .get("scope")
        .and_then(Value::as_str)
        .map(|s| s.split_whitespace().collect())
        .unwrap_or_default();
    match required.iter().find(|r| !granted.contains(&r.as_str())) {
        Some(missing) => Err(ApiError::forbidden(format!("missing scope {missing}"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;

    fn basic_auth() -> Auth {
        Auth {
            basic: vec![BasicCredential {
                user: "funnel".into(),
                password: "abc123".into(),
            }],
            oidc: None,
        }
    }

    #[tokio::test]
    async fn open_server_accepts_anything() {
        assert!(Auth::default().check(None).await.is_ok());
    }

    #[tokio::test]
    async fn basic_credentials() {
        let auth = basic_auth();
        let good = format!("Basic {}", STANDARD.encode("funnel:abc123"));
        let bad = format!("Basic {}", STANDARD.encode("funnel:nope"));

        assert!(auth.check(Some(&good)).await.is_ok());
        assert_eq!(auth.check(None).await.unwrap_err().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(auth.check(Some(&bad)).await.unwrap_err().status(), StatusCode::FORBIDDEN);
        assert_eq!(
            auth.check(Some("Bearer abc")).await.unwrap_err().status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn scopes_must_all_be_granted() {
        let claims = json!({"scope": "read write"});
        assert!(check_scopes(&claims, &["read".into()]).is_ok());
        assert!(check_scopes(&claims, &["read".into(), "admin".into()]).is_err());
        assert!(check_scopes(&json!({}), &[]).is_ok());
    }

    #[tokio::test]
    async fn failed_jwks_fetch_waits_for_the_refresh_interval() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/jwks",
            axum::routing::get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let verifier = OidcVerifier::new(OidcConfig {
            jwks_url: format!("http://{addr}/jwks"),
            ..Default::default()
        });
        for _ in 0..3 {
            assert!(verifier.jwk("k1").await.is_none());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheme_is_case_insensitive() {
        assert_eq!(strip_scheme("bearer tok", "Bearer"), Some("tok"));
        assert_eq!(strip_scheme("Basic", "Basic"), None);
    }
}
