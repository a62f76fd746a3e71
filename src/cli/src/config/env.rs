#[derive(Debug, Clone)]
pub(crate) struct Db {
  pub(crate) ssl: bool,
  pub(crate) domain: String,
  pub(crate) port: Option<String>,
  pub(crate) user: String,
  pub(crate) password: Option<String>,
  pub(crate) name: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Values {
  pub(crate) db: Option<Db>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ParseError {
  #[error("Failed reading env var")]
  EnvVarRead(#[from] std::env::VarError),
}

pub(crate) fn parse() -> Result<Values, ParseError> {
  let _ = dotenv::dotenv();

  // NOTE: without a database domain the volatile store is used
  let db = match std::env::var("LINEPOOL_DB_DOMAIN") {
    Ok(domain) => Some(Db {
      ssl: std::env::var("LINEPOOL_DB_SSL").map_or_else(|_| false, |_| true),
      domain,
      port: std::env::var("LINEPOOL_DB_PORT").ok(),
      user: std::env::var("LINEPOOL_DB_USER")?,
      password: std::env::var("LINEPOOL_DB_PASSWORD").ok(),
      name: std::env::var("LINEPOOL_DB_NAME")?,
    }),
    Err(std::env::VarError::NotPresent) => None,
    Err(error) => return Err(error.into()),
  };

  Ok(Values { db })
}
