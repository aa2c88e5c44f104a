use certification_core::clock::SystemClock;
use certification_core::workflow::{EngineDeps, WorkflowEngine};
use certification_lambda::adapters::dynamo::{
    DynamoCertificateStore, DynamoQuotaLedger, DynamoSessionStore,
};
use certification_lambda::adapters::http::{
    ApiClient, HttpCertificateService, HttpIdentityService, HttpOtpService, HttpPropertyRegistry,
};
use certification_lambda::config::LambdaConfig;
use certification_lambda::handlers::agent::handle_agent_event;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct RuntimeDependencies {
    config: LambdaConfig,
    sessions: DynamoSessionStore,
    certificates: DynamoCertificateStore,
    quota: DynamoQuotaLedger,
    identity: HttpIdentityService,
    otp: HttpOtpService,
    registry: HttpPropertyRegistry,
    dispatcher: HttpCertificateService,
    clock: SystemClock,
}

impl RuntimeDependencies {
    async fn load(config: LambdaConfig) -> Result<Self, Error> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let dynamo = aws_sdk_dynamodb::Client::new(&aws_config);
        let lookups = ApiClient::new(config.http_timeout).map_err(Error::from)?;
        let certificates_client =
            ApiClient::new(config.certificate_timeout).map_err(Error::from)?;

        Ok(Self {
            sessions: DynamoSessionStore {
                client: dynamo.clone(),
                table: config.session_table.clone(),
                idle: config.policy.session_idle(),
            },
            certificates: DynamoCertificateStore {
                client: dynamo.clone(),
                table: config.certificate_table.clone(),
                document_index: config.certificate_document_index.clone(),
            },
            quota: DynamoQuotaLedger {
                client: dynamo,
                table: config.session_table.clone(),
            },
            identity: HttpIdentityService {
                client: lookups.clone(),
                url: config.identity_api_url.clone(),
                sends_otp: config.identity_sends_otp,
            },
            otp: HttpOtpService {
                client: lookups.clone(),
                issue_url: config.identity_api_url.clone(),
                login_url: format!("{}/auth/login", config.cert_api_base_url),
            },
            registry: HttpPropertyRegistry {
                client: lookups,
                base_url: config.cert_api_base_url.clone(),
            },
            dispatcher: HttpCertificateService {
                client: certificates_client,
                base_url: config.cert_api_base_url.clone(),
            },
            clock: SystemClock,
            config,
        })
    }

    fn engine(&self) -> WorkflowEngine<'_> {
        WorkflowEngine::new(
            EngineDeps {
                sessions: &self.sessions,
                certificates: &self.certificates,
                quota: &self.quota,
                identity: &self.identity,
                otp: &self.otp,
                registry: &self.registry,
                dispatcher: &self.dispatcher,
                clock: &self.clock,
            },
            self.config.policy.clone(),
        )
    }
}

async fn handle_request(
    event: LambdaEvent<Value>,
    deps: &RuntimeDependencies,
) -> Result<Value, Error> {
    handle_agent_event(&event.payload, &deps.engine()).map_err(|message| {
        tracing::error!(
            component = "agent_actions",
            event = "undecodable_event",
            request_id = %event.context.request_id,
            reason = %message,
        );
        Error::from(message)
    })
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();
    let config = LambdaConfig::from_env().map_err(Error::from)?;
    let deps = RuntimeDependencies::load(config).await?;
    let deps = &deps;
    lambda_runtime::run(service_fn(move |event| async move {
        handle_request(event, deps).await
    }))
    .await
}
