//! Database environment wiring between instances.
//!
//! A consumer maps each declared dependency to a provider instance. Wiring
//! copies the provider's connection values into the consumer's environment
//! under the variable names the consumer declared.

use std::collections::BTreeMap;

use super::registry::InstanceRegistry;
use super::types::Instance;
use crate::error::{AppError, Result};

/// The consumer's environment with every dependency in `settings.databases` resolved.
///
/// Providers are read from snapshots; no provider lock is held.
pub fn resolve_env(
    consumer: &Instance,
    registry: &InstanceRegistry,
    host: &str,
) -> Result<BTreeMap<String, String>> {
    let mut env = consumer.env.clone();

    for (dependency_id, provider_id) in consumer.databases() {
        let provider = if *provider_id == consumer.id {
            consumer.clone()
        } else {
            registry.get(provider_id)?.snapshot()
        };

        let dependency = consumer
            .service
            .databases
            .get(dependency_id)
            .ok_or_else(|| AppError::not_found("database dependency", dependency_id))?;

        let feature = provider
            .service
            .database_feature(&dependency.types)
            .ok_or_else(|| {
                AppError::not_found(
                    "database feature",
                    &format!("{} ({})", provider_id, dependency.types.join("|")),
                )
            })?;

        let port = provider
            .env
            .get(&feature.port)
            .ok_or_else(|| AppError::not_found("provider variable", &feature.port))?;

        let names = &dependency.names;
        env.insert(names.host.clone(), host.to_string());
        env.insert(names.port.clone(), port.clone());

        let optional = [
            (&feature.username, &names.username),
            (&feature.password, &names.password),
            (&feature.database, &names.database),
        ];
        for (provider_var, consumer_var) in optional {
            let (Some(provider_var), Some(consumer_var)) = (provider_var, consumer_var) else {
                continue;
            };
            if let Some(value) = provider.env.get(provider_var) {
                env.insert(consumer_var.clone(), value.clone());
            }
        }

        log::debug!(
            "Wired dependency {} of instance {} to provider {}",
            dependency_id,
            consumer.id,
            provider_id
        );
    }

    Ok(env)
}

/// First provider (by id) for every declared dependency that is not yet mapped.
///
/// Providers whose environment lacks the feature's port variable are passed over.
pub fn auto_resolve(consumer: &Instance, registry: &InstanceRegistry) -> BTreeMap<String, String> {
    let providers = registry.snapshot();
    let mut resolved = consumer.databases().clone();

    for (dependency_id, dependency) in &consumer.service.databases {
        if resolved.contains_key(dependency_id) {
            continue;
        }
        let provider = providers
            .iter()
            .filter(|p| p.id != consumer.id)
            .find(|p| {
                p.service
                    .database_feature(&dependency.types)
                    .is_some_and(|feature| p.env.contains_key(&feature.port))
            });
        if let Some(provider) = provider {
            log::info!(
                "Dependency {} of instance {} resolved to {}",
                dependency_id,
                consumer.id,
                provider.id
            );
            resolved.insert(dependency_id.clone(), provider.id.clone());
        }
    }

    resolved
}
