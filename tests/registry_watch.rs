// Integration tests for service discovery kept current by store watches
#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use switchyard::{
        adapters::MemoryStore,
        core::{EndpointSet, RegistryError, RegistryOptions, ServiceRegistry},
        ports::service_store::ServiceStore,
    };

    const USERS_V1: &str = r#"[{"Url":"10.0.0.1:8080","Weight":1}]"#;
    const USERS_V2: &str = r#"[{"Url":"10.0.0.7:8080","Weight":3},{"Url":"10.0.0.8:8080","Weight":1}]"#;

    fn addresses(set: &EndpointSet) -> Vec<String> {
        set.iter().map(|e| e.address.clone()).collect()
    }

    /// Re-put `value` until the registry reflects it; the watch may still be subscribing.
    async fn put_until_seen(store: &MemoryStore, registry: &ServiceRegistry, key: &str, value: &str) {
        let expected = EndpointSet::decode(value.as_bytes()).unwrap();
        for _ in 0..200 {
            store.put(key, value.to_string()).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Ok(set) = registry.get(key).await {
                if addresses(&set) == addresses(&expected) {
                    return;
                }
            }
        }
        panic!("registry never observed the update of {key}");
    }

    fn registry_with(store: Arc<MemoryStore>) -> ServiceRegistry {
        ServiceRegistry::new(store, RegistryOptions::default())
    }

    #[tokio::test]
    async fn test_put_event_replaces_endpoint_set() {
        let store = Arc::new(MemoryStore::new());
        store.put("users", USERS_V1.to_string()).await;
        let registry = registry_with(store.clone());
        let services = vec!["users".to_string()];

        registry.start(&services).await;
        let initial = registry.get("users").await.unwrap();
        assert_eq!(addresses(&initial), vec!["10.0.0.1:8080"]);

        put_until_seen(&store, &registry, "users", USERS_V2).await;
        let updated = registry.get("users").await.unwrap();
        assert_eq!(updated.len(), 2);
        assert_eq!(updated.total_weight(), 4);

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_store_delete_evicts_service() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(store.clone());
        registry.start(&["orders".to_string()]).await;

        put_until_seen(&store, &registry, "orders", USERS_V1).await;
        store.delete("orders").await.unwrap();

        let mut evicted = false;
        for _ in 0..200 {
            if matches!(
                registry.get("orders").await,
                Err(RegistryError::ServiceNotFound(_))
            ) {
                evicted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(evicted, "delete event did not evict the cached set");

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_service_appearing_after_start_is_picked_up() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(store.clone());
        registry.start(&["late".to_string()]).await;

        assert!(registry.get("late").await.is_err());
        put_until_seen(&store, &registry, "late", USERS_V1).await;

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_store_and_clears_cache() {
        let store = Arc::new(MemoryStore::new());
        store.put("users", USERS_V1.to_string()).await;
        let registry = registry_with(store.clone());
        registry.start(&["users".to_string()]).await;
        assert_eq!(registry.cached_services(), 1);

        registry.stop().await;

        assert!(store.is_closed());
        assert_eq!(registry.cached_services(), 0);
        assert!(registry.get("users").await.is_err());
        // second stop is a no-op
        registry.stop().await;
    }
}
