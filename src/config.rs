use std::{env, path::PathBuf};

use crate::error::IngestError;

pub const DEFAULT_AUTOMATION_THRESHOLD: i64 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub media_storage_dir: PathBuf,
    pub public_base_url: String,
    pub analysis_base_url: Option<String>,
    pub analysis_api_key: String,
    pub automation_threshold: i64,
    pub background_concurrency: usize,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, IngestError> {
        let port = parse_var("PORT", 4000u16)?;
        let public_base_url = env::var("API_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();
        let analysis_base_url = env::var("ANALYSIS_BASE_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty());

        let automation_threshold = parse_var("AUTOMATION_THRESHOLD", DEFAULT_AUTOMATION_THRESHOLD)?;
        if automation_threshold < 1 {
            return Err(IngestError::Config(
                "AUTOMATION_THRESHOLD must be at least 1".to_string(),
            ));
        }
        let background_concurrency = parse_var("BACKGROUND_CONCURRENCY", 16usize)?.max(1);

        Ok(Self {
            port,
            database_url: resolve_database_url(),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 10u32)?,
            media_storage_dir: env::var("MEDIA_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./media_uploads")),
            public_base_url,
            analysis_base_url,
            analysis_api_key: env::var("ANALYSIS_API_KEY").unwrap_or_default(),
            automation_threshold,
            background_concurrency,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T, IngestError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| IngestError::Config(format!("{key} has an invalid value: {raw}"))),
        _ => Ok(default),
    }
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "wa_ingest".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_falls_back_to_default_when_unset() {
        let value: u16 = parse_var("WA_INGEST_TEST_UNSET_PORT", 4000).unwrap();
        assert_eq!(value, 4000);
    }

    #[test]
    fn parse_var_rejects_garbage() {
        env::set_var("WA_INGEST_TEST_BAD_THRESHOLD", "five");
        let result: Result<i64, _> = parse_var("WA_INGEST_TEST_BAD_THRESHOLD", 5);
        assert!(matches!(result, Err(IngestError::Config(_))));
        env::remove_var("WA_INGEST_TEST_BAD_THRESHOLD");
    }

    #[test]
    fn parse_var_trims_whitespace() {
        env::set_var("WA_INGEST_TEST_POOL", " 32 ");
        let value: usize = parse_var("WA_INGEST_TEST_POOL", 16).unwrap();
        assert_eq!(value, 32);
        env::remove_var("WA_INGEST_TEST_POOL");
    }
}
