/// Agent trial lifecycle driven through the scheduler tasks
use chrono::{Duration, TimeZone, Utc};
use homestead_auth::{
    account::SignupRequest,
    clock::{Clock, ManualClock},
    db::{account::Role, memory_pool},
    jobs::tasks,
    mailer::MemoryNotifier,
    rate_limit::MemoryStore,
    sessions::ClientInfo,
    AppContext, ServerConfig,
};
use std::sync::Arc;

async fn context() -> (AppContext, Arc<ManualClock>, Arc<MemoryNotifier>) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 9, 2, 10, 0, 0).unwrap()));
    let notifier = Arc::new(MemoryNotifier::new());
    let ctx = AppContext::from_parts(
        ServerConfig::for_testing(),
        memory_pool().await.unwrap(),
        clock.clone(),
        notifier.clone(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();
    (ctx, clock, notifier)
}

fn agent_signup(email: &str) -> SignupRequest {
    serde_json::from_value(serde_json::json!({
        "email": email,
        "password": "Tr0ub4dor&Zq",
        "name": "Riley Hart",
        "role": "agent"
    }))
    .unwrap()
}

#[tokio::test]
async fn test_agent_trial_reminder_then_expiry() {
    let (ctx, clock, notifier) = context().await;
    let t0 = clock.now();

    let response = ctx
        .account_manager
        .signup(agent_signup("riley@example.com"), &ClientInfo::default())
        .await
        .unwrap();
    let id = response.user.id.clone();

    let account = ctx.account_manager.get_account(&id).await.unwrap();
    let trial = account.trial.unwrap();
    assert_eq!(trial.start, t0);
    assert_eq!(trial.end, t0 + Duration::days(7));
    assert_eq!(account.listings_quota, 10);

    // Nothing due on day one
    assert_eq!(tasks::send_trial_reminders(&ctx).await.unwrap(), 0);

    clock.set(t0 + Duration::days(4));
    assert_eq!(tasks::send_trial_reminders(&ctx).await.unwrap(), 1);
    assert_eq!(tasks::send_trial_reminders(&ctx).await.unwrap(), 0);

    let account = ctx.account_manager.get_account(&id).await.unwrap();
    assert!(account.trial.unwrap().reminder_sent);
    assert_eq!(account.role, Role::Agent);
    assert_eq!(notifier.sent().len(), 1);

    clock.set(t0 + Duration::days(8));
    assert_eq!(tasks::expire_trials(&ctx).await.unwrap(), 1);
    assert_eq!(tasks::expire_trials(&ctx).await.unwrap(), 0);

    let account = ctx.account_manager.get_account(&id).await.unwrap();
    let trial = account.trial.unwrap();
    assert!(trial.expired);
    assert_eq!(account.role, Role::PrivateSeller);
    assert_eq!(account.listings_quota, 3);
    assert!(!account.subscription.is_subscribed);
    assert_eq!(notifier.sent().len(), 2);
}

#[tokio::test]
async fn test_buyers_are_never_swept() {
    let (ctx, clock, notifier) = context().await;
    let t0 = clock.now();

    let mut request = agent_signup("buyer@example.com");
    request.role = None;
    ctx.account_manager
        .signup(request, &ClientInfo::default())
        .await
        .unwrap();

    clock.set(t0 + Duration::days(30));
    assert_eq!(tasks::send_trial_reminders(&ctx).await.unwrap(), 0);
    assert_eq!(tasks::expire_trials(&ctx).await.unwrap(), 0);
    assert!(notifier.sent().is_empty());
}
