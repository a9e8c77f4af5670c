use amiquip::{Channel, Connection, ExchangeDeclareOptions, ExchangeType, Publish};
use chrono::Utc;
use log::{info, warn};
use serde_json::json;

use crate::config::BrokerConfig;
use crate::error::AppError;

pub const EVENTS_EXCHANGE: &str = "hardware_events.input_selectors";
pub const KEEPALIVE_EXCHANGE: &str = "hardware_boards.keep_alive";

/// Fanout exchanges take any routing key; the original controller publishes
/// with a wildcard.
const ROUTING_KEY: &str = "*";

/// Health of the underlying AMQP channel. A link is never partially
/// repaired: any failure closes it and the next publish reconnects from
/// scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Open,
    Closed,
}

/// One logical broker connection bound to one exchange. Event publishing
/// and keepalive each own their own link so a stalled broker on one never
/// blocks the other.
pub struct BrokerLink {
    url: String,
    exchange: &'static str,
    conn: Option<Connection>,
    channel: Option<Channel>,
}

impl BrokerLink {
    pub fn new(cfg: &BrokerConfig, exchange: &'static str) -> Self {
        Self {
            url: cfg.amqp_url(),
            exchange,
            conn: None,
            channel: None,
        }
    }

    pub fn state(&self) -> LinkState {
        if self.channel.is_some() {
            LinkState::Open
        } else {
            LinkState::Closed
        }
    }

    fn ensure_open(&mut self) -> Result<&Channel, AppError> {
        if self.channel.is_none() {
            info!("connecting to broker for exchange {}", self.exchange);
            let mut conn = Connection::insecure_open(&self.url)
                .map_err(|e| AppError::Publish(format!("broker connect: {e}")))?;
            let channel = conn
                .open_channel(None)
                .map_err(|e| AppError::Publish(format!("open channel: {e}")))?;
            channel
                .exchange_declare(
                    ExchangeType::Fanout,
                    self.exchange,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                )
                .map_err(|e| {
                    AppError::Publish(format!("declare exchange {}: {e}", self.exchange))
                })?;
            self.conn = Some(conn);
            self.channel = Some(channel);
        }
        Ok(self.channel.as_ref().unwrap())
    }

    /// Tears the whole link down. Called on any failure; the next publish
    /// builds a fresh connection, channel and exchange declaration.
    pub fn reset(&mut self) {
        self.channel = None;
        if let Some(conn) = self.conn.take() {
            let _ = conn.close();
        }
    }

    pub fn publish(&mut self, body: &[u8]) -> Result<(), AppError> {
        let exchange = self.exchange;
        let result = (|| {
            let channel = self.ensure_open()?;
            channel
                .basic_publish(exchange, Publish::new(body, ROUTING_KEY))
                .map_err(|e| AppError::Publish(format!("publish to {exchange}: {e}")))
        })();
        if let Err(ref e) = result {
            warn!("broker link to {exchange} failed, closing: {e}");
            self.reset();
        }
        result
    }
}

/// Periodic liveness sender on its own link. Unlike event publishing, a
/// failure here surfaces to the caller: the supervising loop uses it to
/// detect a broker outage and drive the fault indicator.
pub struct KeepaliveSender {
    link: BrokerLink,
}

impl KeepaliveSender {
    pub fn new(cfg: &BrokerConfig) -> Self {
        Self {
            link: BrokerLink::new(cfg, KEEPALIVE_EXCHANGE),
        }
    }

    pub fn publish_keepalive(&mut self, board_id: i64) -> Result<(), AppError> {
        let body = keepalive_body(board_id);
        self.link.publish(&body)
    }
}

pub fn keepalive_body(board_id: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "timestamp": Utc::now(),
        "hardware_board_id": board_id,
        "message": "Ping",
    }))
    .unwrap_or_default()
}
