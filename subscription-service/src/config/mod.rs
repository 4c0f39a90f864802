use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use std::env;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub sweep: SweepConfig,
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct GatewayConfig {
    pub key_id: String,
    pub key_secret: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SweepConfig {
    /// Interval between background expiry sweeps. Zero disables the worker.
    pub interval_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("SUBSCRIPTION_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SUBSCRIPTION_SERVICE_PORT")
            .unwrap_or_else(|_| "3005".to_string())
            .parse()?;

        let db_url =
            env::var("SUBSCRIPTION_DATABASE_URL").context("SUBSCRIPTION_DATABASE_URL must be set")?;
        let db_name = env::var("SUBSCRIPTION_DATABASE_NAME")
            .unwrap_or_else(|_| "subscription_db".to_string());

        let gateway_key_id = env::var("GATEWAY_KEY_ID").unwrap_or_default();
        let gateway_key_secret = env::var("GATEWAY_KEY_SECRET").unwrap_or_default();
        let gateway_webhook_secret = env::var("GATEWAY_WEBHOOK_SECRET").unwrap_or_default();
        let gateway_api_base_url = env::var("GATEWAY_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.razorpay.com/v1".to_string());

        let sweep_interval_seconds = env::var("SUBSCRIPTION_SWEEP_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                db_name,
            },
            gateway: GatewayConfig {
                key_id: gateway_key_id,
                key_secret: Secret::new(gateway_key_secret),
                webhook_secret: Secret::new(gateway_webhook_secret),
                api_base_url: gateway_api_base_url,
            },
            sweep: SweepConfig {
                interval_seconds: sweep_interval_seconds,
            },
            service_name: "subscription-service".to_string(),
        })
    }
}
