use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Capacity of the rumqttc request queue and of the inbound/outbound channels.
    pub channel_capacity: usize,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "lightpost-sim".to_string(),
            keep_alive_secs: 60,
            channel_capacity: 100,
            username: None,
            password: None,
        }
    }
}

impl MqttConfig {
    pub fn options(&self) -> MqttOptions {
        self.options_for(&self.client_id)
    }

    /// Same broker settings under another client id, so a second client does not
    /// take over the gateway's session.
    pub fn options_for(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));
        if let (Some(user), Some(pw)) = (&self.username, &self.password) {
            options.set_credentials(user, pw);
        }
        options
    }
}
