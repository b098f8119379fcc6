use std::sync::Arc;

use atoll_domain::conversations::ConversationService;
use atoll_domain::events::EventFanout;
use atoll_domain::notifications::NotificationService;
use atoll_domain::ports::conversations::ConversationRepository;
use atoll_domain::ports::notifications::{
    DeliveryDispatcher, NotificationRepository, PreferenceStore,
};
use atoll_infra::config::AppConfig;
use atoll_infra::db::{self, DbConfig};
use atoll_infra::repositories::{
    InMemoryConversationRepository, InMemoryNotificationRepository, InMemoryPreferenceStore,
    StaticContentDirectory, SurrealConversationRepository, SurrealNotificationRepository,
    SurrealPreferenceStore, TracingDeliveryDispatcher, define_schema,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub notification_repo: Arc<dyn NotificationRepository>,
    pub conversation_repo: Arc<dyn ConversationRepository>,
    pub preferences: Arc<dyn PreferenceStore>,
    /// Stand-in for the platform's entity lookups (users/posts/comments),
    /// which live outside this service.
    pub directory: Arc<StaticContentDirectory>,
    pub dispatcher: Arc<dyn DeliveryDispatcher>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let directory = Arc::new(StaticContentDirectory::new());
        let dispatcher: Arc<dyn DeliveryDispatcher> = Arc::new(TracingDeliveryDispatcher::new());

        let state = if config.data_backend.eq_ignore_ascii_case("surreal") {
            let client = db::connect(&DbConfig::from_app_config(&config)).await?;
            define_schema(&client)
                .await
                .map_err(|err| anyhow::anyhow!("define surreal schema: {err}"))?;
            Self {
                config,
                notification_repo: Arc::new(SurrealNotificationRepository::new(client.clone())),
                conversation_repo: Arc::new(SurrealConversationRepository::new(client.clone())),
                preferences: Arc::new(SurrealPreferenceStore::new(client)),
                directory,
                dispatcher,
            }
        } else {
            Self {
                config,
                notification_repo: Arc::new(InMemoryNotificationRepository::new()),
                conversation_repo: Arc::new(InMemoryConversationRepository::new()),
                preferences: Arc::new(InMemoryPreferenceStore::new()),
                directory,
                dispatcher,
            }
        };

        if state.config.auth_dev_bypass_enabled
            && state.config.app_env.eq_ignore_ascii_case("development")
        {
            state.directory.add_user("dev-user", "dev-user").await;
        }

        Ok(state)
    }

    pub fn notifications(&self) -> NotificationService {
        NotificationService::new(
            self.notification_repo.clone(),
            self.preferences.clone(),
            self.directory.clone(),
            self.dispatcher.clone(),
        )
    }

    pub fn conversations(&self) -> ConversationService {
        ConversationService::new(self.conversation_repo.clone())
    }

    pub fn event_fanout(&self) -> EventFanout {
        EventFanout::new(self.notifications(), self.directory.clone())
    }
}
