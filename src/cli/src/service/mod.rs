pub(crate) mod acquisition;
pub(crate) mod cache;
pub(crate) mod connection;
pub(crate) mod db;
pub(crate) mod field;
pub(crate) mod poller;
#[allow(dead_code, reason = "queried by the distribution layer")]
pub(crate) mod pool;
pub(crate) mod production;
pub(crate) mod push;
pub(crate) mod recorder;
pub(crate) mod registry;
pub(crate) mod shift;

use std::sync::Arc;

use crate::config;

#[derive(Debug, Clone)]
pub(crate) struct Container {
  registry: registry::Registry,
  store: Arc<dyn db::Store>,
  clock: Arc<dyn shift::Clock>,
  recorder: recorder::Recorder,
  acquisition: acquisition::Service,
  pool: pool::Pool,
}

impl Container {
  pub(crate) fn new(config: config::Values) -> Self {
    let store: Arc<dyn db::Store> = match &config.db {
      Some(db) => Arc::new(db::postgres::PostgresStore::new(db)),
      None => {
        tracing::warn!("No database configured, using the volatile store");
        Arc::new(db::memory::MemoryStore::new())
      }
    };
    let clock: Arc<dyn shift::Clock> =
      Arc::new(shift::SystemClock::new(config.timezone));
    let client: Arc<dyn field::Client> =
      Arc::new(field::modbus::Client::new());

    let cache = cache::Cache::new();
    let recorder = recorder::Recorder::new(
      store.clone(),
      config.history_queue_capacity,
      config.termination_timeout,
    );
    let publisher = push::Publisher::new(cache.clone(), config.push_capacity);
    let acquisition = acquisition::Service::new(
      &config.registry,
      acquisition::Shared {
        cache: cache.clone(),
        recorder: recorder.clone(),
        publisher: publisher.clone(),
        clock: clock.clone(),
        client,
        params: config.params,
        layout: config.layout,
        termination_timeout: config.termination_timeout,
      },
    );
    let pool = pool::Pool::new(
      config.registry.clone(),
      cache,
      store.clone(),
      publisher,
      clock.clone(),
    );

    Self {
      registry: config.registry,
      store,
      clock,
      recorder,
      acquisition,
      pool,
    }
  }

  pub(crate) fn registry(&self) -> &registry::Registry {
    &self.registry
  }

  pub(crate) fn store(&self) -> &Arc<dyn db::Store> {
    &self.store
  }

  pub(crate) fn clock(&self) -> &Arc<dyn shift::Clock> {
    &self.clock
  }

  pub(crate) fn acquisition(&self) -> &acquisition::Service {
    &self.acquisition
  }

  pub(crate) fn pool(&self) -> &pool::Pool {
    &self.pool
  }

  /// Stops the workers first so their last jobs reach the recorder.
  pub(crate) async fn terminate(&self) {
    self.acquisition.terminate().await;
    if let Err(error) = self.recorder.terminate().await {
      tracing::error!("Failed terminating recorder {}", error);
    }
  }
}
