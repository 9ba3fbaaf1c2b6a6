//! Integration tests for ticket lifecycles.
//!
//! End-to-end flows through factory, registry and validator over the
//! in-memory backend, driven by a manual clock.

use chrono::TimeDelta;
use futures::StreamExt;
use sso_tickets::{
    Authentication, Clock, ExpirationPolicy, IdGeneratorConfig, PlainTicketCodec, RegistryConfig,
    Service, Ticket, TicketError, TicketFactory, TicketFilter, TicketIdGenerator, TicketKind,
    TicketPolicies, TicketRegistry, TicketValidator,
    mocks::{ManualClock, MockServiceResolver},
    stores::MemoryTicketStorage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const HOUR: u64 = 3600;

/// Wired-up engine over one shared in-memory backend.
struct Sso {
    factory: TicketFactory<MemoryTicketStorage, MockServiceResolver>,
    validator: TicketValidator<MemoryTicketStorage, MockServiceResolver>,
    registry: TicketRegistry<MemoryTicketStorage>,
    clock: Arc<ManualClock>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sso(policies: TicketPolicies) -> Sso {
    init_tracing();

    let clock = Arc::new(ManualClock::at_epoch());
    let resolver = Arc::new(MockServiceResolver::allow_all());
    let registry = TicketRegistry::new(
        MemoryTicketStorage::new(),
        Arc::new(PlainTicketCodec),
        clock.clone(),
        RegistryConfig::default(),
    );

    Sso {
        factory: TicketFactory::new(
            registry.clone(),
            Arc::clone(&resolver),
            TicketIdGenerator::new(IdGeneratorConfig::default()).unwrap(),
            policies,
        ),
        validator: TicketValidator::new(registry.clone(), resolver),
        registry,
        clock,
    }
}

fn app() -> Service {
    Service::new("https://app.example.com")
}

fn login(clock: &ManualClock) -> Authentication {
    Authentication::new("casuser", clock.now())
        .with_attribute("mail", "casuser@example.com")
        .with_handler("LdapAuthenticationHandler")
}

async fn all_tickets(registry: &TicketRegistry<MemoryTicketStorage>) -> Vec<Ticket> {
    registry
        .get_all(TicketFilter::all().including_expired())
        .map(|ticket| ticket.unwrap())
        .collect()
        .await
}

#[tokio::test]
async fn test_service_ticket_lifecycle() {
    let policies = TicketPolicies::new().with_policy(
        TicketKind::TicketGranting,
        ExpirationPolicy::hard_and_idle(Duration::from_secs(2 * HOUR), Duration::from_secs(1800)),
    );
    let sso = sso(policies);

    let tgt = sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();
    let st = sso.factory.grant_service_ticket(tgt.id(), app()).await.unwrap();

    // First presentation succeeds and identifies the principal.
    let validated = sso
        .validator
        .validate_service_ticket(st.id().as_str(), &app())
        .await
        .unwrap();
    assert_eq!(validated.authentication().principal_id, "casuser");
    assert_eq!(
        validated.authentication().attributes.get("mail"),
        Some(&vec!["casuser@example.com".to_string()])
    );

    // Second presentation of the same ticket is a replay.
    let replay = sso.validator.validate_service_ticket(st.id().as_str(), &app()).await;
    assert!(matches!(replay, Err(TicketError::AlreadyConsumed { .. })));

    // A ticket left unused past its own lifetime has expired...
    let stale = sso.factory.grant_service_ticket(tgt.id(), app()).await.unwrap();
    sso.clock.advance(TimeDelta::seconds(15));
    let late = sso.validator.validate_service_ticket(stale.id().as_str(), &app()).await;
    assert!(matches!(late, Err(TicketError::TicketExpired { .. })));

    // ...while the session keeps issuing fresh ones.
    let fresh = sso.factory.grant_service_ticket(tgt.id(), app()).await.unwrap();
    let validated = sso
        .validator
        .validate_service_ticket(fresh.id().as_str(), &app())
        .await
        .unwrap();
    assert_eq!(validated.parent(), Some(tgt.id()));
}

#[tokio::test]
async fn test_delete_with_children_removes_whole_session() {
    let sso = sso(TicketPolicies::new());
    let client = Service::new("oauth-client");

    let tgt = sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();
    let other = sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();
    sso.factory.grant_service_ticket(tgt.id(), app()).await.unwrap();
    sso.factory
        .create_authorization_code(tgt.id(), client.clone(), ["openid"])
        .await
        .unwrap();
    sso.factory
        .create_access_token(tgt.id(), client, ["openid"])
        .await
        .unwrap();

    assert_eq!(all_tickets(&sso.registry).await.len(), 5);

    let removed = sso.registry.delete_with_children(tgt.id()).await.unwrap();
    assert_eq!(removed, 4);

    let remaining = all_tickets(&sso.registry).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id(), other.id());
}

#[tokio::test]
async fn test_logout_expires_descendants_immediately() {
    let sso = sso(TicketPolicies::new());
    let tgt = sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();
    let st = sso.factory.grant_service_ticket(tgt.id(), app()).await.unwrap();

    sso.registry.mark_expired(tgt.id()).await.unwrap();

    let result = sso.validator.validate_service_ticket(st.id().as_str(), &app()).await;
    assert!(matches!(result, Err(TicketError::TicketExpired { .. })));
    assert!(matches!(
        sso.registry.get(tgt.id()).await,
        Err(TicketError::TicketNotFound { .. })
    ));
}

#[tokio::test]
async fn test_sovereign_refresh_token_outlives_session() {
    let sso = sso(TicketPolicies::new().with_sovereign_refresh_tokens(true));
    let client = Service::new("oauth-client");

    let tgt = sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();
    let refresh = sso
        .factory
        .create_refresh_token(tgt.id(), client.clone(), ["offline_access"])
        .await
        .unwrap();
    let access = sso
        .factory
        .create_access_token(tgt.id(), client.clone(), ["openid"])
        .await
        .unwrap();

    sso.registry.mark_expired(tgt.id()).await.unwrap();

    assert!(!sso.registry.is_expired(&refresh).await.unwrap());
    assert!(sso.registry.is_expired(&access).await.unwrap());

    // The refresh token keeps working, and its tokens hang off it.
    let renewed = sso
        .factory
        .refresh_access_token(refresh.id(), &client)
        .await
        .unwrap();
    assert!(!sso.registry.is_expired(&renewed).await.unwrap());

    // Cascade deletion leaves the sovereign branch alone.
    assert_eq!(sso.registry.delete_with_children(tgt.id()).await.unwrap(), 2);
    assert_ok!(sso.registry.get(refresh.id()).await);
    assert_ok!(sso.registry.get(renewed.id()).await);
}

#[tokio::test]
async fn test_refresh_token_dies_with_session_by_default() {
    let sso = sso(TicketPolicies::new());
    let client = Service::new("oauth-client");

    let tgt = sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();
    let refresh = sso
        .factory
        .create_refresh_token(tgt.id(), client.clone(), ["offline_access"])
        .await
        .unwrap();

    sso.registry.mark_expired(tgt.id()).await.unwrap();

    assert!(sso.registry.is_expired(&refresh).await.unwrap());
    let result = sso.factory.refresh_access_token(refresh.id(), &client).await;
    assert!(matches!(result, Err(TicketError::TicketExpired { .. })));
}

#[tokio::test]
async fn test_proxy_chain() {
    let sso = sso(TicketPolicies::new());
    let callback = Service::new("https://proxy.example.com/callback");
    let backend = Service::new("https://backend.example.com");

    let tgt = sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();
    let pgt = sso
        .factory
        .grant_proxy_granting_ticket(tgt.id(), callback)
        .await
        .unwrap();
    let pt = sso.factory.grant_proxy_ticket(pgt.id(), backend.clone()).await.unwrap();

    let not_a_service_ticket = sso
        .validator
        .validate_service_ticket(pt.id().as_str(), &backend)
        .await;
    assert!(matches!(not_a_service_ticket, Err(TicketError::InvalidTicket { .. })));

    let validated = sso
        .validator
        .validate_proxy_ticket(pt.id().as_str(), &backend)
        .await
        .unwrap();
    assert_eq!(validated.parent(), Some(pgt.id()));
    assert_eq!(validated.authentication().principal_id, "casuser");

    // A proxy ticket cannot be the root of another chain.
    let nested = sso.factory.grant_proxy_ticket(pt.id(), app()).await;
    assert!(matches!(nested, Err(TicketError::InvalidTicket { .. })));
}

#[tokio::test]
async fn test_remember_me_session_outlives_idle_timeout() {
    let policies = TicketPolicies::new().with_policy(
        TicketKind::TicketGranting,
        ExpirationPolicy::hard_and_idle(Duration::from_secs(8 * HOUR), Duration::from_secs(2 * HOUR))
            .with_remember_me(ExpirationPolicy::time_to_live(Duration::from_secs(14 * 24 * HOUR))),
    );
    let sso = sso(policies);

    let remembered = sso
        .factory
        .create_ticket_granting_ticket(login(&sso.clock).with_attribute("rememberMe", "true"))
        .await
        .unwrap();
    let regular = sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();

    sso.clock.advance(TimeDelta::hours(3));

    assert_ok!(sso.registry.get(remembered.id()).await);
    assert!(matches!(
        sso.registry.get(regular.id()).await,
        Err(TicketError::TicketNotFound { .. })
    ));
}

#[tokio::test]
async fn test_minting_off_expired_session_changes_nothing() {
    let sso = sso(TicketPolicies::new());
    let tgt = sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();

    // Idle past the two-hour default.
    sso.clock.advance(TimeDelta::hours(3));

    let result = sso.factory.grant_service_ticket(tgt.id(), app()).await;
    assert!(matches!(result, Err(TicketError::InvalidTicket { .. })));

    // No child stored, parent untouched.
    assert_eq!(all_tickets(&sso.registry).await.len(), 1);
    assert_eq!(sso.registry.load(tgt.id()).await.unwrap(), Some(tgt));
}

#[tokio::test]
async fn test_overlapping_sweeps_converge() {
    let sso = sso(TicketPolicies::new());
    for _ in 0..10 {
        sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();
    }
    sso.clock.advance(TimeDelta::hours(3));
    let survivor = sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();

    // Two nodes sweeping the same backend at once.
    let node_a = sso.registry.clone();
    let node_b = sso.registry.clone();
    let (a, b) = tokio::join!(node_a.sweep(), node_b.sweep());
    assert_eq!(a.unwrap() + b.unwrap(), 10);

    assert_eq!(sso.registry.sweep().await.unwrap(), 0);
    let remaining = all_tickets(&sso.registry).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id(), survivor.id());
}

#[tokio::test]
async fn test_stats_report_sessions_and_service_tickets() {
    let sso = sso(TicketPolicies::new());
    let tgt = sso.factory.create_ticket_granting_ticket(login(&sso.clock)).await.unwrap();
    sso.factory.grant_service_ticket(tgt.id(), app()).await.unwrap();
    sso.factory.grant_service_ticket(tgt.id(), app()).await.unwrap();

    let stats = sso.registry.stats().await.unwrap();
    assert_eq!(stats.session_count(), 1);
    assert_eq!(stats.service_ticket_count(), 2);
    assert_eq!(stats.total(), 3);

    let by_principal = sso
        .registry
        .count(TicketFilter::kind(TicketKind::Service).with_principal("casuser"))
        .await
        .unwrap();
    assert_eq!(by_principal, 2);
}
