use stash_core::pack::DEFAULT_MAX_PACK_SIZE;

#[derive(Clone, Debug)]
pub struct Config {
    pub server_name: String,
    pub data_dir: String,
    pub rest_port: u16,
    /// Bearer token required on every API route; None disables auth
    /// (local development only).
    pub api_key: Option<String>,
    pub max_pack_size: u64,
    pub compression_level: i32,
    pub session_ttl_secs: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            server_name: std::env::var("STASHD_SERVER_NAME")
                .unwrap_or_else(|_| "stashd".to_string()),
            data_dir: std::env::var("STASHD_DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string()),
            rest_port: std::env::var("STASHD_REST_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()?,
            api_key: std::env::var("STASHD_API_KEY").ok().filter(|k| !k.is_empty()),
            max_pack_size: std::env::var("STASHD_MAX_PACK_SIZE")
                .ok()
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(DEFAULT_MAX_PACK_SIZE),
            compression_level: std::env::var("STASHD_COMPRESSION_LEVEL")
                .ok()
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(3),
            session_ttl_secs: std::env::var("STASHD_SESSION_TTL_SECS")
                .ok()
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(24 * 60 * 60),
        })
    }
}
