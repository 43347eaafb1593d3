//! Binance connector
//!
//! Spot catalog and tickers from the public REST API, live tickers from
//! the combined WebSocket endpoint. No API key required for any of the
//! endpoints used here.
//!
//! Rate limits: 1200 request weight/minute (IP-based)

use super::{lenient_f64, split_symbol, ExchangeConnector, ExchangeSession};
use crate::errors::ExchangeError;
use crate::types::{ConnectionKind, Instrument, MarketType, Tick};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

const REST_URL: &str = "https://api.binance.com/api/v3";
const WS_URL: &str = "wss://stream.binance.com:9443/ws";

pub const EXCHANGE_ID: &str = "binance";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Binance connector implementing the venue boundary for spot markets.
pub struct BinanceConnector {
    http: Client,
}

impl BinanceConnector {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("spreadscan/0.1")
            .build()
            .expect("Failed to create HTTP client");
        Self { http }
    }
}

impl Default for BinanceConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn exchange_id(&self) -> &str {
        EXCHANGE_ID
    }

    /// "BTC/USDT" -> "BTCUSDT"
    fn to_venue_symbol(&self, symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    async fn load_catalog(&self) -> Result<Vec<Instrument>, ExchangeError> {
        let url = format!("{}/exchangeInfo", REST_URL);
        debug!("Fetching Binance exchange info");

        let result: anyhow::Result<ExchangeInfo> = async {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .context("Failed to fetch exchangeInfo")?;
            if !response.status().is_success() {
                anyhow::bail!("exchangeInfo returned {}", response.status());
            }
            response
                .json::<ExchangeInfo>()
                .await
                .context("Failed to parse exchangeInfo")
        }
        .await;

        let info = result.map_err(|source| ExchangeError::Catalog {
            exchange: EXCHANGE_ID.to_string(),
            source,
        })?;

        let instruments = info
            .symbols
            .into_iter()
            .filter(|s| s.is_spot_trading_allowed)
            .map(|s| {
                let active = s.status == "TRADING";
                Instrument::new(EXCHANGE_ID, s.base_asset, s.quote_asset, MarketType::Spot, active)
            })
            .collect();

        Ok(instruments)
    }

    async fn connect(
        &self,
        kind: ConnectionKind,
    ) -> Result<Box<dyn ExchangeSession>, ExchangeError> {
        let ws = match kind {
            ConnectionKind::Rest => None,
            ConnectionKind::Stream => {
                let (stream, _) = connect_async(WS_URL)
                    .await
                    .map_err(|e| ExchangeError::transport(EXCHANGE_ID, e))?;
                debug!("Binance stream connection established");
                Some(stream)
            }
        };

        Ok(Box::new(BinanceSession {
            kind,
            http: self.http.clone(),
            ws,
            subscription: None,
            next_request_id: 1,
        }))
    }
}

struct Subscription {
    symbol: String,
    venue_symbol: String,
    quote: String,
}

/// One live Binance handle, either REST or WebSocket.
pub struct BinanceSession {
    kind: ConnectionKind,
    http: Client,
    ws: Option<WsStream>,
    subscription: Option<Subscription>,
    next_request_id: u64,
}

impl BinanceSession {
    fn tick_from_ticker(&self, symbol: &str, quote: &str, t: &Ticker24hr) -> Tick {
        Tick {
            exchange_id: EXCHANGE_ID.to_string(),
            symbol: symbol.to_string(),
            market_type: MarketType::Spot,
            quote: quote.to_string(),
            last: lenient_f64(&t.last_price),
            bid: lenient_f64(&t.bid_price),
            ask: lenient_f64(&t.ask_price),
            base_volume: lenient_f64(&t.volume),
            observed_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ExchangeSession for BinanceSession {
    fn exchange_id(&self) -> &str {
        EXCHANGE_ID
    }

    fn kind(&self) -> ConnectionKind {
        self.kind
    }

    async fn fetch_snapshot(&mut self, symbol: &str) -> Result<Tick, ExchangeError> {
        if self.kind != ConnectionKind::Rest {
            return Err(ExchangeError::protocol(
                EXCHANGE_ID,
                "snapshot requested on a stream handle",
            ));
        }
        let (_, quote) = split_symbol(symbol).ok_or_else(|| ExchangeError::UnknownSymbol {
            exchange: EXCHANGE_ID.to_string(),
            symbol: symbol.to_string(),
        })?;

        let venue_symbol = symbol.replace('/', "").to_uppercase();
        let url = format!("{}/ticker/24hr?symbol={}", REST_URL, venue_symbol);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::transport(EXCHANGE_ID, e))?;

        if !response.status().is_success() {
            let status = response.status();
            if status.as_u16() == 400 {
                return Err(ExchangeError::UnknownSymbol {
                    exchange: EXCHANGE_ID.to_string(),
                    symbol: symbol.to_string(),
                });
            }
            return Err(ExchangeError::transport(
                EXCHANGE_ID,
                format!("ticker returned {}", status),
            ));
        }

        let ticker: Ticker24hr = response
            .json()
            .await
            .map_err(|e| ExchangeError::protocol(EXCHANGE_ID, e))?;

        Ok(self.tick_from_ticker(symbol, quote, &ticker))
    }

    async fn subscribe(&mut self, symbol: &str) -> Result<(), ExchangeError> {
        let ws = self.ws.as_mut().ok_or_else(|| {
            ExchangeError::protocol(EXCHANGE_ID, "subscribe requested on a rest handle")
        })?;
        let (_, quote) = split_symbol(symbol).ok_or_else(|| ExchangeError::UnknownSymbol {
            exchange: EXCHANGE_ID.to_string(),
            symbol: symbol.to_string(),
        })?;

        let venue_symbol = symbol.replace('/', "").to_uppercase();
        let request = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": [format!("{}@ticker", venue_symbol.to_lowercase())],
            "id": self.next_request_id,
        });
        self.next_request_id += 1;

        ws.send(Message::Text(request.to_string()))
            .await
            .map_err(|e| ExchangeError::transport(EXCHANGE_ID, e))?;

        self.subscription = Some(Subscription {
            symbol: symbol.to_string(),
            venue_symbol,
            quote: quote.to_string(),
        });
        Ok(())
    }

    async fn next_tick(&mut self) -> Result<Tick, ExchangeError> {
        let sub_symbol;
        let sub_quote;
        let sub_venue;
        match &self.subscription {
            Some(sub) => {
                sub_symbol = sub.symbol.clone();
                sub_quote = sub.quote.clone();
                sub_venue = sub.venue_symbol.clone();
            }
            None => {
                return Err(ExchangeError::protocol(
                    EXCHANGE_ID,
                    "next_tick called before subscribe",
                ))
            }
        }
        let ws = self.ws.as_mut().ok_or_else(|| {
            ExchangeError::protocol(EXCHANGE_ID, "next_tick requested on a rest handle")
        })?;

        loop {
            let msg = ws
                .next()
                .await
                .ok_or_else(|| ExchangeError::transport(EXCHANGE_ID, "stream closed"))?
                .map_err(|e| ExchangeError::transport(EXCHANGE_ID, e))?;

            match msg {
                Message::Text(text) => {
                    // Subscribe acks and other control payloads fail this
                    // parse and are skipped
                    let event: TickerEvent = match serde_json::from_str(&text) {
                        Ok(ev) => ev,
                        Err(_) => continue,
                    };
                    if event.event_type != "24hrTicker" || event.symbol != sub_venue {
                        continue;
                    }
                    return Ok(Tick {
                        exchange_id: EXCHANGE_ID.to_string(),
                        symbol: sub_symbol,
                        market_type: MarketType::Spot,
                        quote: sub_quote,
                        last: lenient_f64(&event.last_price),
                        bid: lenient_f64(&event.bid_price),
                        ask: lenient_f64(&event.ask_price),
                        base_volume: lenient_f64(&event.base_volume),
                        observed_at: Utc::now(),
                    });
                }
                Message::Ping(payload) => {
                    ws.send(Message::Pong(payload))
                        .await
                        .map_err(|e| ExchangeError::transport(EXCHANGE_ID, e))?;
                }
                Message::Close(_) => {
                    return Err(ExchangeError::transport(EXCHANGE_ID, "server closed stream"));
                }
                _ => {}
            }
        }
    }

    async fn ping(&mut self) -> Result<(), ExchangeError> {
        match self.kind {
            ConnectionKind::Rest => {
                let url = format!("{}/time", REST_URL);
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| ExchangeError::transport(EXCHANGE_ID, e))?;
                if !response.status().is_success() {
                    return Err(ExchangeError::transport(
                        EXCHANGE_ID,
                        format!("time endpoint returned {}", response.status()),
                    ));
                }
                Ok(())
            }
            ConnectionKind::Stream => {
                let ws = self.ws.as_mut().ok_or_else(|| {
                    ExchangeError::transport(EXCHANGE_ID, "stream handle lost its socket")
                })?;
                ws.send(Message::Ping(Vec::new()))
                    .await
                    .map_err(|e| ExchangeError::transport(EXCHANGE_ID, e))
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
    }
}

/// Subset of the exchangeInfo response
#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    #[allow(dead_code)]
    symbol: String,
    base_asset: String,
    quote_asset: String,
    status: String,
    #[serde(default)]
    is_spot_trading_allowed: bool,
}

/// Subset of the 24hr ticker REST response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24hr {
    last_price: String,
    bid_price: String,
    ask_price: String,
    volume: String,
}

/// Streaming ticker event (`<symbol>@ticker`)
#[derive(Debug, Deserialize)]
struct TickerEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "b")]
    bid_price: String,
    #[serde(rename = "a")]
    ask_price: String,
    #[serde(rename = "v")]
    base_volume: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_conversion() {
        let connector = BinanceConnector::new();
        assert_eq!(connector.to_venue_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(connector.to_venue_symbol("eth/usdt"), "ETHUSDT");
    }

    #[test]
    fn test_ticker_event_parse() {
        let raw = r#"{"e":"24hrTicker","E":123456789,"s":"BTCUSDT","c":"50000.10","b":"49999.90","a":"50000.30","v":"1234.5","q":"61725000.0"}"#;
        let event: TickerEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type, "24hrTicker");
        assert_eq!(event.symbol, "BTCUSDT");
        assert_eq!(lenient_f64(&event.last_price), 50000.10);
    }

    #[test]
    fn test_subscribe_ack_is_not_a_ticker() {
        let raw = r#"{"result":null,"id":1}"#;
        assert!(serde_json::from_str::<TickerEvent>(raw).is_err());
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_load_catalog() {
        let connector = BinanceConnector::new();
        let catalog = connector.load_catalog().await.unwrap();
        assert!(catalog.iter().any(|i| i.symbol == "BTC/USDT" && i.active));
    }
}
