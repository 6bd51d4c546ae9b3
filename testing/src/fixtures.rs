use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

const DB_NAME: &str = "perms_sync";
const DB_USER: &str = "perms";
const DB_PASSWORD: &str = "perms";

pub struct PostgresFixture {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    url: String
}

impl PostgresFixture {
    pub fn url(&self) -> &str {
        &self.url
    }
}

static POSTGRES: OnceCell<Option<PostgresFixture>> = OnceCell::const_new();

pub async fn postgres() -> Option<&'static PostgresFixture> {
    POSTGRES
        .get_or_init(|| async {
            let started = Postgres::default()
                .with_db_name(DB_NAME)
                .with_user(DB_USER)
                .with_password(DB_PASSWORD)
                .start()
                .await;

            match started {
                Ok(container) => {
                    let port = match container.get_host_port_ipv4(5432).await {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!("Failed to get PostgreSQL port: {:?}", e);
                            return None;
                        }
                    };
                    tracing::info!(port, "PostgreSQL fixture started");
                    Some(PostgresFixture {
                        container,
                        url: connection_url(port)
                    })
                }
                Err(e) => {
                    tracing::warn!("Failed to start PostgreSQL container: {:?}", e);
                    None
                }
            }
        })
        .await
        .as_ref()
}

fn connection_url(port: u16) -> String {
    format!(
        "postgres://{}:{}@localhost:{}/{}",
        DB_USER, DB_PASSWORD, port, DB_NAME
    )
}
