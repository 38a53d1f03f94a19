//! 引擎隔离集成测试

use std::sync::Arc;

use apiary::config::KeywordSection;
use apiary::core::{ApiaryError, UserContext};
use apiary::engine::{ExecutionEngineFactory, FactoryConfig, RunStatus};
use apiary::gateway::{CommunicationChannel, MemoryChannel, MemoryChannelSource};
use apiary::llm::MockLlmClient;
use apiary::orchestration::{
    default_registry, ControllerConfig, ExecutionRequest, OrchestrationController, StagePlanner,
};

fn factory(source: Arc<MemoryChannelSource>) -> ExecutionEngineFactory {
    let controller = OrchestrationController::new(
        default_registry(Arc::new(MockLlmClient::new())),
        StagePlanner::new(&KeywordSection::default()).unwrap(),
        ControllerConfig::default(),
    );
    ExecutionEngineFactory::builder()
        .config(FactoryConfig::default())
        .channel_source(source)
        .controller(Arc::new(controller))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_distinct_users_get_disjoint_engines() {
    let source = Arc::new(MemoryChannelSource::new());
    let factory = factory(source.clone());

    let alice = factory
        .create_for_user(&UserContext::new("alice", "t1").unwrap())
        .await
        .unwrap();
    let bob = factory
        .create_for_user(&UserContext::new("bob", "t1").unwrap())
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&alice, &bob));
    assert_ne!(alice.id(), bob.id());
    assert!(!alice.shares_state_with(&bob).await);
    assert_eq!(source.opened().len(), 2);

    let state = alice
        .execute(ExecutionRequest::new("How do I optimize cloud costs?"))
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);

    assert_eq!(alice.stats().runs_started, 1);
    assert_eq!(bob.stats().runs_started, 0);
    assert!(bob.get_run(&state.run_id).await.is_none());

    let opened = source.opened();
    let alice_channel: Arc<dyn CommunicationChannel> = alice.channel().await.unwrap();
    let alice_events = opened
        .iter()
        .find(|c| c.channel_id() == alice_channel.channel_id())
        .map(|c| c.messages().len())
        .unwrap_or(0);
    let bob_channel: Arc<dyn CommunicationChannel> = bob.channel().await.unwrap();
    let bob_events = opened
        .iter()
        .find(|c| c.channel_id() == bob_channel.channel_id())
        .map(|c| c.messages().len())
        .unwrap_or(0);
    assert!(alice_events > 0);
    assert_eq!(bob_events, 0);
}

#[tokio::test]
async fn test_cleanup_of_one_user_leaves_other_untouched() {
    let factory = factory(Arc::new(MemoryChannelSource::new()));
    let alice = factory
        .create_for_user(&UserContext::new("alice", "t1").unwrap())
        .await
        .unwrap();
    let bob = factory
        .create_for_user(&UserContext::new("bob", "t1").unwrap())
        .await
        .unwrap();

    assert_eq!(factory.cleanup_user_engines("alice").await, 1);
    assert!(alice.is_closed());
    assert!(!bob.is_closed());
    assert!(factory.get_engine(bob.id()).await.is_some());

    let state = bob.execute(ExecutionRequest::new("hello")).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert!(matches!(
        alice.execute(ExecutionRequest::new("hello")).await,
        Err(ApiaryError::EngineClosed(_))
    ));
}

#[tokio::test]
async fn test_concurrent_runs_do_not_cross() {
    let factory = Arc::new(factory(Arc::new(MemoryChannelSource::new())));
    let mut handles = Vec::new();
    for i in 0..8 {
        let factory = factory.clone();
        handles.push(tokio::spawn(async move {
            let user = format!("user{i}");
            let ctx = UserContext::new(user.clone(), "t1").unwrap();
            let engine = factory.get_or_create_for_user(&ctx).await.unwrap();
            let state = engine
                .execute(ExecutionRequest::new(format!("analyze usage for {user}")))
                .await
                .unwrap();
            (user, engine.user_id().to_string(), state)
        }));
    }

    for handle in handles {
        let (user, engine_user, state) = handle.await.unwrap();
        assert_eq!(user, engine_user);
        let report = state.report.unwrap();
        assert!(report.summary.contains(&user));
    }
    assert_eq!(factory.get_factory_metrics().await.total_created, 8);
}

#[test]
fn test_placeholder_and_cyclic_contexts_rejected() {
    assert!(matches!(
        UserContext::new("registry", "t1"),
        Err(ApiaryError::InvalidContext(_))
    ));
    let parent = UserContext::new("alice", "t1").unwrap();
    let cross_user = UserContext::builder("bob", "t1").parent(&parent).build();
    assert!(matches!(cross_user, Err(ApiaryError::InvalidContext(_))));

    let cyclic = UserContext::builder("alice", "t1")
        .run_id("run_a")
        .ancestry(vec!["run_a".into()])
        .build();
    assert!(cyclic.is_err());
}
