use crate::balancer::Strategy;
use clap::Parser;
use url::Url;

/// Gateway configuration, assembled from command-line arguments,
/// environment variables and an optional `.env` file.
#[derive(Debug, Clone, Parser)]
#[command(name = "llm-gateway")]
#[command(about = "A load-balancing, caching dispatch gateway for Ollama-compatible LLM backends")]
#[command(version)]
pub struct Config {
    // =========================================================================
    // SERVER
    // =========================================================================
    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port to listen on
    #[arg(short, long, env = "PORT", default_value = "8080")]
    pub port: u16,

    // =========================================================================
    // BACKENDS
    // =========================================================================
    /// Base URL of the single backend used when no instance list is given
    #[arg(long, env = "OLLAMA_BASE_URL", default_value = "http://localhost:11434")]
    pub ollama_base_url: String,

    /// Comma-separated backend URLs; empty means the single base URL
    #[arg(long, env = "OLLAMA_INSTANCES", default_value = "")]
    pub ollama_instances: String,

    /// Model used when a request does not name one
    #[arg(long, env = "DEFAULT_MODEL", default_value = "deepseek-coder:6.7b")]
    pub default_model: String,

    /// Default generation token budget (num_predict)
    #[arg(long, env = "MAX_TOKENS", default_value = "4096")]
    pub max_tokens: u32,

    /// Default sampling temperature
    #[arg(long, env = "TEMPERATURE", default_value = "0.7")]
    pub temperature: f32,

    // =========================================================================
    // DISPATCH POLICY
    // =========================================================================
    /// Load balancing strategy: round_robin, least_connections, random, weighted_random
    #[arg(long, env = "LOAD_BALANCER_STRATEGY", default_value = "round_robin")]
    pub load_balancer_strategy: String,

    /// Response cache TTL in seconds
    #[arg(long, env = "CACHE_TTL", default_value = "3600")]
    pub cache_ttl: u64,

    /// Chat endpoint rate limit (requests per minute per client)
    #[arg(long, env = "RATE_LIMIT_PER_MINUTE", default_value = "60")]
    pub rate_limit_per_minute: u32,

    /// When all backends are unhealthy: refuse with 503 instead of
    /// falling back to the full backend set
    #[arg(long, env = "STRICT_UNHEALTHY", default_value = "false")]
    pub strict_unhealthy: bool,

    /// When the retry budget is exhausted: serve a synthetic 200 body
    /// instead of a 502
    #[arg(long, env = "FALLBACK_RESPONSE", default_value = "true")]
    pub fallback_response: bool,

    // =========================================================================
    // SECURITY
    // =========================================================================
    /// Static bearer API key for service accounts
    #[arg(long, env = "API_KEY", default_value = "")]
    pub api_key: String,

    /// HMAC secret for signed bearer tokens
    #[arg(long, env = "SECRET_KEY", default_value = "")]
    pub secret_key: String,

    /// Signing algorithm for bearer tokens
    #[arg(long, env = "JWT_ALGORITHM", default_value = "HS256")]
    pub jwt_algorithm: String,

    /// Lifetime of minted tokens in minutes
    #[arg(long, env = "JWT_EXPIRE_MINUTES", default_value = "30")]
    pub jwt_expire_minutes: i64,

    /// Comma-separated allowed CORS origins; "*" allows any
    #[arg(long, env = "CORS_ORIGINS", default_value = "http://localhost:3000")]
    pub cors_origins: String,

    // =========================================================================
    // RUNTIME
    // =========================================================================
    /// Environment (development, staging, production)
    #[arg(long, env = "ENVIRONMENT", default_value = "development")]
    pub environment: String,

    /// Log filter (error, warn, info, debug, trace)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Parse configuration from CLI arguments and environment, set up
    /// logging, and validate. Exits the process with code 1 on invalid
    /// configuration — an unrecoverable startup error.
    pub fn parse_args() -> Self {
        let _ = dotenv::dotenv();

        let config = Self::parse();
        config.setup_logging();

        if let Err(err) = config.validate() {
            eprintln!("Configuration validation failed: {}", err);
            std::process::exit(1);
        }

        config
    }

    /// The backend URL list: `OLLAMA_INSTANCES` split on commas, or the
    /// single `OLLAMA_BASE_URL` when the list is empty.
    pub fn backend_urls(&self) -> Vec<String> {
        let urls: Vec<String> = self
            .ollama_instances
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches('/').to_string())
            .collect();

        if urls.is_empty() {
            vec![self.ollama_base_url.trim_end_matches('/').to_string()]
        } else {
            urls
        }
    }

    /// Allowed CORS origins as a list.
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// The configured load-balancing strategy. `validate` has already
    /// rejected unknown names, so parse failures here fall back to
    /// round-robin rather than panicking.
    pub fn strategy(&self) -> Strategy {
        self.load_balancer_strategy
            .parse()
            .unwrap_or(Strategy::RoundRobin)
    }

    fn setup_logging(&self) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(self.log_level.clone())
            .with_target(false)
            .try_init();
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0. Please specify a valid port number (1-65535).".to_string());
        }

        if self.host.is_empty() {
            return Err("Host cannot be empty.".to_string());
        }

        for url in self.backend_urls() {
            match Url::parse(&url) {
                Ok(parsed) => {
                    if !["http", "https"].contains(&parsed.scheme()) {
                        return Err(format!(
                            "Invalid backend URL scheme '{}' in '{}'. Only http and https are supported.",
                            parsed.scheme(),
                            url
                        ));
                    }
                    if parsed.host().is_none() {
                        return Err(format!("Backend URL '{}' must include a host.", url));
                    }
                }
                Err(err) => {
                    return Err(format!("Invalid backend URL '{}': {}", url, err));
                }
            }
        }

        if self.load_balancer_strategy.parse::<Strategy>().is_err() {
            return Err(format!(
                "Invalid load balancer strategy '{}'. Valid options are: round_robin, least_connections, random, weighted_random",
                self.load_balancer_strategy
            ));
        }

        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&self.environment.as_str()) {
            return Err(format!(
                "Invalid environment '{}'. Valid options are: {}",
                self.environment,
                valid_environments.join(", ")
            ));
        }

        if self.environment == "production" && self.secret_key.is_empty() {
            return Err("SECRET_KEY must be set when ENVIRONMENT=production.".to_string());
        }

        let valid_algorithms = ["HS256", "HS384", "HS512"];
        if !valid_algorithms.contains(&self.jwt_algorithm.as_str()) {
            return Err(format!(
                "Invalid JWT algorithm '{}'. Valid options are: {}",
                self.jwt_algorithm,
                valid_algorithms.join(", ")
            ));
        }

        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        let base_level = self.log_level.split(',').next().unwrap_or("");
        if !base_level.contains('=') && !valid_log_levels.contains(&base_level) {
            return Err(format!(
                "Invalid log level '{}'. Valid options are: {}",
                self.log_level,
                valid_log_levels.join(", ")
            ));
        }

        if self.rate_limit_per_minute == 0 {
            eprintln!(
                "Warning: RATE_LIMIT_PER_MINUTE=0 will reject every chat request. \
                Set a reasonable limit (e.g. 60)."
            );
        }

        if self.environment == "production" && self.cors_origin_list().iter().any(|o| o == "*") {
            eprintln!("Warning: CORS origin '*' in production is not recommended.");
        }

        Ok(())
    }

    /// Minimal configuration for tests.
    pub fn for_test() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_instances: String::new(),
            default_model: "deepseek-coder:6.7b".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            load_balancer_strategy: "round_robin".to_string(),
            cache_ttl: 3600,
            rate_limit_per_minute: 60,
            strict_unhealthy: false,
            fallback_response: true,
            api_key: "test-api-key".to_string(),
            secret_key: "test-secret-key".to_string(),
            jwt_algorithm: "HS256".to_string(),
            jwt_expire_minutes: 30,
            cors_origins: "*".to_string(),
            environment: "development".to_string(),
            log_level: "info".to_string(),
        }
    }
}
