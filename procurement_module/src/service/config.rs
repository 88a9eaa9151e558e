use std::env;
use std::time::Duration;

use crate::attachments::{ObjectAcl, SupabaseStorageConfig, DEFAULT_BUCKET};
use crate::dispatch::DispatchConfig;
use crate::llm::{LlmConfig, LlmProvider, DEFAULT_LLM_TIMEOUT};
use crate::pipeline::EnrichmentMode;
use crate::store::StoreBackend;

use super::BoxError;

pub const DEFAULT_INBOUND_BODY_MAX_BYTES: usize = 25 * 1024 * 1024;
pub const DEFAULT_SYSTEM_USER_EMAIL: &str = "system@procurement.local";
const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_FROM_NAME: &str = "AerChain";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret expected in the inbound webhook's `token` query parameter.
    pub inbound_token: Option<String>,
    pub inbound_body_max_bytes: usize,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_tls_allow_invalid_certs: bool,
    pub llm: LlmConfig,
    /// None when Supabase credentials are missing.
    pub storage: Option<SupabaseStorageConfig>,
    pub attachments_acl: ObjectAcl,
    pub attachments_cdn_url: Option<String>,
    pub storage_timeout: Duration,
    pub sendgrid_api_key: Option<String>,
    pub sendgrid_api_base_url: Option<String>,
    pub dispatch: DispatchConfig,
    pub enrichment_mode: EnrichmentMode,
    pub system_user_email: String,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env_var_non_empty("PROCUREMENT_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = env::var("PROCUREMENT_PORT")
            .ok()
            .and_then(|value| value.trim().parse::<u16>().ok())
            .unwrap_or(5000);
        let inbound_body_max_bytes = env::var("INBOUND_MAX_BODY_BYTES")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_INBOUND_BODY_MAX_BYTES);

        let store_backend = match env_var_non_empty("PROCUREMENT_STORE_BACKEND") {
            Some(value) => StoreBackend::parse(&value)
                .ok_or_else(|| format!("unknown PROCUREMENT_STORE_BACKEND: {}", value))?,
            None => StoreBackend::Postgres,
        };
        let database_url = env_var_non_empty("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err("DATABASE_URL is required for the postgres store backend".into());
        }

        let enrichment_mode = match env_var_non_empty("ENRICHMENT_MODE") {
            Some(value) => EnrichmentMode::parse(&value)
                .ok_or_else(|| format!("unknown ENRICHMENT_MODE: {}", value))?,
            None => EnrichmentMode::Background,
        };

        let storage_timeout = env_secs("STORAGE_TIMEOUT_SECS").unwrap_or(DEFAULT_STORAGE_TIMEOUT);
        let attachments_acl = if env_flag("ATTACHMENTS_PUBLIC", true) {
            ObjectAcl::PublicRead
        } else {
            ObjectAcl::Private
        };
        let storage = match (
            env_var_non_empty("SUPABASE_PROJECT_URL"),
            env_var_non_empty("SUPABASE_SECRET_KEY"),
        ) {
            (Some(project_url), Some(service_key)) => Some(SupabaseStorageConfig {
                project_url,
                service_key,
                bucket: env_var_non_empty("ATTACHMENTS_BUCKET")
                    .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
                acl: attachments_acl,
                timeout: storage_timeout,
            }),
            _ => None,
        };

        let reply_domain = env_var_non_empty("REPLY_DOMAIN").unwrap_or_else(|| "localhost".to_string());
        let dispatch = DispatchConfig {
            from_email: env_var_non_empty("SENDGRID_FROM_EMAIL")
                .unwrap_or_else(|| format!("rfp@{}", reply_domain)),
            from_name: env_var_non_empty("SENDGRID_FROM_NAME")
                .unwrap_or_else(|| DEFAULT_FROM_NAME.to_string()),
            reply_domain,
        };

        Ok(Self {
            host,
            port,
            inbound_token: env_var_non_empty("INBOUND_WEBHOOK_TOKEN"),
            inbound_body_max_bytes,
            store_backend,
            database_url,
            db_tls_allow_invalid_certs: env_flag("PROCUREMENT_DB_TLS_ALLOW_INVALID_CERTS", false),
            llm: resolve_llm_config()?,
            storage,
            attachments_acl,
            attachments_cdn_url: env_var_non_empty("ATTACHMENTS_CDN_URL"),
            storage_timeout,
            sendgrid_api_key: env_var_non_empty("SENDGRID_API_KEY"),
            sendgrid_api_base_url: env_var_non_empty("SENDGRID_API_BASE_URL"),
            dispatch,
            enrichment_mode,
            system_user_email: env_var_non_empty("SYSTEM_USER_EMAIL")
                .unwrap_or_else(|| DEFAULT_SYSTEM_USER_EMAIL.to_string()),
        })
    }
}

/// In-memory store, no collaborators configured.
impl Default for ServiceConfig {
    fn default() -> Self {
        let provider = LlmProvider::Gemini;
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            inbound_token: None,
            inbound_body_max_bytes: DEFAULT_INBOUND_BODY_MAX_BYTES,
            store_backend: StoreBackend::Memory,
            database_url: None,
            db_tls_allow_invalid_certs: false,
            llm: LlmConfig {
                provider,
                api_key: None,
                api_url: provider.default_api_url().to_string(),
                model: provider.default_model().to_string(),
                timeout: DEFAULT_LLM_TIMEOUT,
            },
            storage: None,
            attachments_acl: ObjectAcl::PublicRead,
            attachments_cdn_url: None,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
            sendgrid_api_key: None,
            sendgrid_api_base_url: None,
            dispatch: DispatchConfig {
                from_email: "rfp@localhost".to_string(),
                from_name: DEFAULT_FROM_NAME.to_string(),
                reply_domain: "localhost".to_string(),
            },
            enrichment_mode: EnrichmentMode::Background,
            system_user_email: DEFAULT_SYSTEM_USER_EMAIL.to_string(),
        }
    }
}

fn resolve_llm_config() -> Result<LlmConfig, BoxError> {
    let openai_key = env_var_non_empty("OPENAI_API_KEY");
    let provider = match env_var_non_empty("LLM_PROVIDER") {
        Some(value) => LlmProvider::parse(&value)
            .ok_or_else(|| format!("unknown LLM_PROVIDER: {}", value))?,
        None if openai_key.is_some() => LlmProvider::OpenAI,
        None => LlmProvider::Gemini,
    };
    let (api_key, api_url) = match provider {
        LlmProvider::OpenAI => (openai_key, env_var_non_empty("OPENAI_API_URL")),
        LlmProvider::Gemini => (
            env_var_non_empty("GEMINI_API_KEY"),
            env_var_non_empty("GEMINI_API_URL"),
        ),
    };
    Ok(LlmConfig {
        provider,
        api_key,
        api_url: api_url.unwrap_or_else(|| provider.default_api_url().to_string()),
        model: env_var_non_empty("LLM_MODEL")
            .unwrap_or_else(|| provider.default_model().to_string()),
        timeout: env_secs("LLM_TIMEOUT_SECS").unwrap_or(DEFAULT_LLM_TIMEOUT),
    })
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y"
        ),
        Err(_) => default,
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_var_non_empty(key)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
