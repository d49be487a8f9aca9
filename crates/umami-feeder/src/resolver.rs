// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname to website id resolution.
//!
//! Lookups take a short shared lock on the cache. Unknown hostnames may be created on the
//! collector; creation is serialized by a separate async mutex so the cache lock is never held
//! across the remote call, and a second caller for the same hostname finds the entry on its
//! re-check instead of creating a duplicate.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::event::parse_domain_from_host;
use crate::http::{CollectorClient, Website};

#[derive(Debug)]
pub struct SiteResolver {
    sites: RwLock<HashMap<String, String>>,
    create_lock: Mutex<()>,
    client: CollectorClient,
    token: RwLock<Option<String>>,
    team_id: Option<String>,
}

impl SiteResolver {
    /// Starts from the static mappings; their hostnames are normalized like request hosts.
    #[must_use]
    pub fn new(
        client: CollectorClient,
        static_sites: &HashMap<String, String>,
        token: Option<String>,
        team_id: Option<String>,
    ) -> Self {
        let sites = static_sites
            .iter()
            .map(|(host, id)| (parse_domain_from_host(host), id.clone()))
            .collect();
        Self {
            sites: RwLock::new(sites),
            create_lock: Mutex::new(()),
            client,
            token: RwLock::new(token.filter(|t| !t.is_empty())),
            team_id,
        }
    }

    #[must_use]
    pub fn lookup(&self, hostname: &str) -> Option<String> {
        self.sites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hostname)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, hostname: &str) -> bool {
        self.sites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(hostname)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sites.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_token(&self, token: String) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Merges fetched websites. Existing entries, static ones included, are kept.
    ///
    /// Returns how many hostnames were added.
    pub fn seed(&self, websites: Vec<Website>) -> usize {
        let mut sites = self.sites.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;
        for website in websites {
            let hostname = parse_domain_from_host(&website.domain);
            if hostname.is_empty() || website.id.is_empty() || sites.contains_key(&hostname) {
                continue;
            }
            sites.insert(hostname, website.id);
            added += 1;
        }
        added
    }

    /// Returns the website id for `hostname`, creating the website on the collector if needed.
    ///
    /// A failed creation is logged and yields `None` for this call only; the next request for
    /// the same hostname tries again.
    pub async fn resolve(&self, hostname: &str) -> Option<String> {
        if let Some(id) = self.lookup(hostname) {
            return Some(id);
        }

        let _creating = self.create_lock.lock().await;
        if let Some(id) = self.lookup(hostname) {
            return Some(id);
        }

        let Some(token) = self.token() else {
            error!(hostname, "failed to create website: no token");
            return None;
        };

        let website = match self
            .client
            .create_website(&token, self.team_id.as_deref(), hostname)
            .await
        {
            Ok(website) => website,
            Err(e) => {
                error!(hostname, error = %e, "failed to create website");
                return None;
            }
        };
        if website.id.is_empty() {
            error!(hostname, "failed to create website: empty id returned");
            return None;
        }

        debug!(hostname, id = %website.id, "website created");
        self.sites
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hostname.to_string(), website.id.clone());
        Some(website.id)
    }
}
