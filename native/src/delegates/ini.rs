// Ini lookups pass straight through: values may change between two queries.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use super::{delegate, HostError};
use crate::ipc::Arg;

#[async_trait]
pub trait IniHost: Send + Sync {
    async fn get_ini_string(
        &self,
        file: &str,
        section: &str,
        key: &str,
    ) -> Result<Option<String>, HostError>;

    async fn get_ini_int(
        &self,
        file: &str,
        section: &str,
        key: &str,
    ) -> Result<Option<i64>, HostError>;
}

pub struct IniProxy {
    host: Arc<dyn IniHost>,
}

impl IniProxy {
    pub fn new(host: Arc<dyn IniHost>) -> Self {
        Self { host }
    }

    pub async fn get_ini_string(
        &self,
        file: &str,
        section: &str,
        key: &str,
    ) -> Result<Option<String>, HostError> {
        self.host.get_ini_string(file, section, key).await
    }

    pub async fn get_ini_int(
        &self,
        file: &str,
        section: &str,
        key: &str,
    ) -> Result<Option<i64>, HostError> {
        self.host.get_ini_int(file, section, key).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IniArgs {
    ini_file_name: String,
    ini_section: String,
    ini_key: String,
}

pub(crate) fn bind(proxy: Arc<IniProxy>) -> Arg {
    let strings = Arc::clone(&proxy);
    let ints = proxy;
    Arg::object([
        (
            "getIniString",
            delegate("getIniString", move |args: IniArgs| {
                let proxy = Arc::clone(&strings);
                async move {
                    proxy
                        .get_ini_string(&args.ini_file_name, &args.ini_section, &args.ini_key)
                        .await
                }
            }),
        ),
        (
            "getIniInt",
            delegate("getIniInt", move |args: IniArgs| {
                let proxy = Arc::clone(&ints);
                async move {
                    proxy
                        .get_ini_int(&args.ini_file_name, &args.ini_section, &args.ini_key)
                        .await
                }
            }),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegates::StaticHost;
    use crate::test_support::{callback_at, register_all, RawPeer};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicI64, Ordering};

    struct ChangingIni {
        value: AtomicI64,
    }

    #[async_trait]
    impl IniHost for ChangingIni {
        async fn get_ini_string(
            &self,
            _file: &str,
            _section: &str,
            _key: &str,
        ) -> Result<Option<String>, HostError> {
            Ok(Some(self.value.load(Ordering::SeqCst).to_string()))
        }

        async fn get_ini_int(
            &self,
            _file: &str,
            _section: &str,
            _key: &str,
        ) -> Result<Option<i64>, HostError> {
            Ok(Some(self.value.fetch_add(1, Ordering::SeqCst)))
        }
    }

    #[tokio::test]
    async fn every_query_reaches_the_host() {
        let proxy = IniProxy::new(Arc::new(ChangingIni {
            value: AtomicI64::new(1),
        }));

        let first = proxy.get_ini_int("Skyrim.ini", "Display", "iSize").await;
        let second = proxy.get_ini_int("Skyrim.ini", "Display", "iSize").await;
        assert_eq!(first, Ok(Some(1)));
        assert_eq!(second, Ok(Some(2)));
        assert_eq!(
            proxy.get_ini_string("Skyrim.ini", "Display", "iSize").await,
            Ok(Some("3".to_string()))
        );
    }

    #[tokio::test]
    async fn lookups_answer_over_the_connection() {
        let (connection, mut peer) = RawPeer::connect();
        let host = StaticHost::from_json(
            r#"{ "ini": { "Skyrim.ini": { "Display": { "iSize W": "1920", "sName": "x" } } } }"#,
        )
        .unwrap();
        let ini = register_all(&connection, bind(Arc::new(IniProxy::new(Arc::new(host)))));
        let key = |key: &str| {
            json!({ "iniFileName": "skyrim.ini", "iniSection": "Display", "iniKey": key })
        };

        let get_int = callback_at(&ini, "getIniInt");
        let get_string = callback_at(&ini, "getIniString");
        assert_eq!(peer.invoke(&get_int, key("iSize W")).await, Ok(json!(1920)));
        assert_eq!(peer.invoke(&get_string, key("sName")).await, Ok(json!("x")));
        assert_eq!(peer.invoke(&get_string, key("missing")).await, Ok(Value::Null));

        let failed = peer.invoke(&get_int, key("sName")).await.unwrap_err();
        assert_eq!(failed.name, "HostError");
        assert!(failed.message.starts_with("getIniInt: "));

        let unnamed = peer
            .invoke(&get_string, json!({ "file": "skyrim.ini" }))
            .await
            .unwrap_err();
        assert_eq!(unnamed.name, "InvalidArguments");
    }
}
