//! Sessions tie together the configuration, the parties and the default crypto provider.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use ndarray::ArrayD;
use tracing::debug;

use crate::{
    config::Config,
    error::Result,
    field::Field,
    fixed::FixedPointTensor,
    party::Party,
    provider::CryptoProvider,
    shared::SharedTensor,
};

/// The name of the party that backs the default crypto provider.
pub const LOCAL_WORKER: &str = "local_worker";

/// A computation among a set of named parties.
///
/// Every session owns its own local worker and default crypto provider, nothing is shared
/// between sessions.
#[derive(Debug)]
pub struct Session {
    config: Config,
    field: Field,
    local_worker: Party,
    provider: CryptoProvider,
    parties: Mutex<HashMap<String, Party>>,
    derived_providers: AtomicU64,
}

impl Session {
    /// Validates the configuration and creates the local worker with its crypto provider.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let local_worker = Party::new(LOCAL_WORKER);
        let provider = match config.provider_seed {
            Some(seed) => CryptoProvider::with_seed(local_worker.clone(), seed),
            None => CryptoProvider::new(local_worker.clone()),
        };
        debug!(
            "New session over a field of size {}, scale {}^{}",
            config.field_size, config.base, config.precision_fractional
        );
        Ok(Self {
            field: Field::new(config.field_size),
            config,
            local_worker,
            provider,
            parties: Mutex::new(HashMap::new()),
            derived_providers: AtomicU64::new(0),
        })
    }

    /// The configuration of the session.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The field all shares of the session live in.
    pub fn field(&self) -> Field {
        self.field
    }

    /// The party backing the default crypto provider.
    pub fn local_worker(&self) -> &Party {
        &self.local_worker
    }

    /// The default crypto provider, used whenever none is given explicitly.
    pub fn default_provider(&self) -> &CryptoProvider {
        &self.provider
    }

    /// Returns the party called `name`, creating it on first use.
    pub fn party(&self, name: &str) -> Party {
        let mut parties = self
            .parties
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        parties
            .entry(name.to_string())
            .or_insert_with(|| Party::new(name))
            .clone()
    }

    /// Returns the parties with the given names, in order.
    pub fn parties(&self, names: &[&str]) -> Vec<Party> {
        names.iter().map(|n| self.party(n)).collect()
    }

    /// Makes `party` a crypto provider.
    ///
    /// With a seeded configuration, every provider gets its own seed derived from the session
    /// seed, so that runs stay reproducible.
    pub fn crypto_provider(&self, party: &Party) -> CryptoProvider {
        match self.config.provider_seed {
            Some(seed) => {
                let n = self.derived_providers.fetch_add(1, Ordering::Relaxed) + 1;
                CryptoProvider::with_seed(party.clone(), seed.wrapping_add(n))
            }
            None => CryptoProvider::new(party.clone()),
        }
    }

    /// Secret-shares integers between `parties`, using the default provider if `provider` is
    /// `None`.
    pub fn share(
        &self,
        value: &ArrayD<i64>,
        parties: &[Party],
        provider: Option<&CryptoProvider>,
    ) -> Result<SharedTensor> {
        SharedTensor::share(
            value,
            parties,
            provider.unwrap_or(&self.provider),
            self.field,
        )
    }

    /// Encodes reals with the session's fixed-point parameters.
    pub fn fix_prec(&self, values: &ArrayD<f64>) -> Result<FixedPointTensor> {
        FixedPointTensor::encode(values, self.config.base, self.config.precision_fractional)
    }

    /// Encodes reals and secret-shares the encoding between `parties`.
    pub fn share_fixed(
        &self,
        values: &ArrayD<f64>,
        parties: &[Party],
        provider: Option<&CryptoProvider>,
    ) -> Result<FixedPointTensor> {
        self.fix_prec(values)?
            .share(parties, provider.unwrap_or(&self.provider), self.field)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;
    use crate::error::Error;

    #[test]
    fn parties_are_created_once() -> Result<()> {
        let session = Session::new(Config::default())?;
        let bob = session.party("bob");
        assert_eq!(session.party("bob"), bob);
        assert_ne!(session.party("alice"), bob);
        Ok(())
    }

    #[test]
    fn sessions_do_not_share_providers() -> Result<()> {
        let a = Session::new(Config::default())?;
        let b = Session::new(Config::default())?;
        assert_ne!(a.local_worker(), b.local_worker());
        assert_eq!(a.default_provider().party().id().0, LOCAL_WORKER);
        Ok(())
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(matches!(
            Session::new(Config::default().with_field_size(3)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn missing_provider_falls_back_to_the_local_worker() -> Result<()> {
        let session = Session::new(Config::default().with_provider_seed(1))?;
        let parties = session.parties(&["bob", "alice"]);
        let x = session.share(&arr1(&[1i64, 2]).into_dyn(), &parties, None)?;
        assert_eq!(x.crypto_provider().party(), session.local_worker());
        let y = x.mul(&x)?;
        assert_eq!(session.default_provider().triples_dealt(), 1);
        assert_eq!(y.get()?, arr1(&[1i64, 4]).into_dyn());
        Ok(())
    }
}
