//! OKX connector
//!
//! Spot and perpetual-swap catalogs and tickers from the public v5 REST
//! API, live tickers from the public WebSocket endpoint. No API key
//! required for any of the endpoints used here.
//!
//! Canonical symbols: spot pairs are `BASE/QUOTE`; swaps carry the
//! settlement currency as a suffix (`BTC/USDT:USDT`) so that spot and
//! swap entries for the same pair never collide on one cache key.

use super::{lenient_f64, ExchangeConnector, ExchangeSession};
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

const REST_URL: &str = "https://www.okx.com/api/v5";
const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

pub const EXCHANGE_ID: &str = "okx";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Break a canonical symbol into (base, quote, market type).
fn parse_canonical(symbol: &str) -> Option<(&str, &str, MarketType)> {
    let (pair, settle) = match symbol.split_once(':') {
        Some((pair, _settle)) => (pair, true),
        None => (symbol, false),
    };
    let (base, quote) = pair.split_once('/')?;
    let market_type = if settle { MarketType::Swap } else { MarketType::Spot };
    Some((base, quote, market_type))
}

/// OKX connector implementing the venue boundary for spot and swap markets.
pub struct OkxConnector {
    http: Client,
}

impl OkxConnector {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("spreadscan/0.1")
            .build()
            .expect("Failed to create HTTP client");
        Self { http }
    }

    async fn fetch_instruments(&self, inst_type: &str) -> anyhow::Result<Vec<OkxInstrument>> {
        let url = format!("{}/public/instruments?instType={}", REST_URL, inst_type);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {} instruments", inst_type))?;
        if !response.status().is_success() {
            anyhow::bail!("instruments returned {}", response.status());
        }
        let body: OkxResponse<OkxInstrument> = response
            .json()
            .await
            .context("Failed to parse instruments")?;
        if body.code != "0" {
            anyhow::bail!("instruments returned code {}", body.code);
        }
        Ok(body.data)
    }
}

impl Default for OkxConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeConnector for OkxConnector {
    fn exchange_id(&self) -> &str {
        EXCHANGE_ID
    }

    /// "BTC/USDT" -> "BTC-USDT", "BTC/USDT:USDT" -> "BTC-USDT-SWAP"
    fn to_venue_symbol(&self, symbol: &str) -> String {
        match parse_canonical(symbol) {
            Some((base, quote, MarketType::Swap)) => format!("{}-{}-SWAP", base, quote),
            Some((base, quote, _)) => format!("{}-{}", base, quote),
            None => symbol.replace('/', "-"),
        }
    }

    async fn load_catalog(&self) -> Result<Vec<Instrument>, ExchangeError> {
        let mut instruments = Vec::new();

        for inst_type in ["SPOT", "SWAP"] {
            debug!("Fetching OKX {} instruments", inst_type);
            let raw = self
                .fetch_instruments(inst_type)
                .await
                .map_err(|source| ExchangeError::Catalog {
                    exchange: EXCHANGE_ID.to_string(),
                    source,
                })?;

            for inst in raw {
                let active = inst.state == "live";
                match inst_type {
                    "SPOT" => {
                        if inst.base_ccy.is_empty() || inst.quote_ccy.is_empty() {
                            continue;
                        }
                        instruments.push(Instrument::new(
                            EXCHANGE_ID,
                            inst.base_ccy,
                            inst.quote_ccy,
                            MarketType::Spot,
                            active,
                        ));
                    }
                    _ => {
                        // Swap pairs carry base/quote in the underlying
                        // ("BTC-USDT"); settlement currency suffixes the
                        // canonical symbol
                        let Some((base, quote)) = inst.uly.split_once('-') else {
                            continue;
                        };
                        if inst.settle_ccy.is_empty() {
                            continue;
                        }
                        instruments.push(Instrument {
                            exchange_id: EXCHANGE_ID.to_string(),
                            symbol: format!("{}/{}:{}", base, quote, inst.settle_ccy),
                            base: base.to_string(),
                            quote: quote.to_string(),
                            market_type: MarketType::Swap,
                            active,
                        });
                    }
                }
            }
        }

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
                debug!("OKX stream connection established");
                Some(stream)
            }
        };

        Ok(Box::new(OkxSession {
            kind,
            http: self.http.clone(),
            ws,
            subscription: None,
        }))
    }
}

struct Subscription {
    symbol: String,
    venue_symbol: String,
    quote: String,
    market_type: MarketType,
}

/// One live OKX handle, either REST or WebSocket.
pub struct OkxSession {
    kind: ConnectionKind,
    http: Client,
    ws: Option<WsStream>,
    subscription: Option<Subscription>,
}

#[async_trait]
impl ExchangeSession for OkxSession {
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
        let (_, quote, market_type) =
            parse_canonical(symbol).ok_or_else(|| ExchangeError::UnknownSymbol {
                exchange: EXCHANGE_ID.to_string(),
                symbol: symbol.to_string(),
            })?;

        let venue_symbol = match market_type {
            MarketType::Swap => symbol
                .split_once(':')
                .map(|(pair, _)| format!("{}-SWAP", pair.replace('/', "-")))
                .unwrap_or_default(),
            _ => symbol.replace('/', "-"),
        };
        let url = format!("{}/market/ticker?instId={}", REST_URL, venue_symbol);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::transport(EXCHANGE_ID, e))?;

        if !response.status().is_success() {
            return Err(ExchangeError::transport(
                EXCHANGE_ID,
                format!("ticker returned {}", response.status()),
            ));
        }

        let body: OkxResponse<OkxTicker> = response
            .json()
            .await
            .map_err(|e| ExchangeError::protocol(EXCHANGE_ID, e))?;

        let ticker = body.data.into_iter().next().ok_or_else(|| {
            ExchangeError::UnknownSymbol {
                exchange: EXCHANGE_ID.to_string(),
                symbol: symbol.to_string(),
            }
        })?;

        Ok(Tick {
            exchange_id: EXCHANGE_ID.to_string(),
            symbol: symbol.to_string(),
            market_type,
            quote: quote.to_string(),
            last: lenient_f64(&ticker.last),
            bid: lenient_f64(&ticker.bid_px),
            ask: lenient_f64(&ticker.ask_px),
            base_volume: lenient_f64(&ticker.vol_24h),
            observed_at: Utc::now(),
        })
    }

    async fn subscribe(&mut self, symbol: &str) -> Result<(), ExchangeError> {
        let (_, quote, market_type) =
            parse_canonical(symbol).ok_or_else(|| ExchangeError::UnknownSymbol {
                exchange: EXCHANGE_ID.to_string(),
                symbol: symbol.to_string(),
            })?;
        let quote = quote.to_string();

        let venue_symbol = match market_type {
            MarketType::Swap => symbol
                .split_once(':')
                .map(|(pair, _)| format!("{}-SWAP", pair.replace('/', "-")))
                .unwrap_or_default(),
            _ => symbol.replace('/', "-"),
        };

        let ws = self.ws.as_mut().ok_or_else(|| {
            ExchangeError::protocol(EXCHANGE_ID, "subscribe requested on a rest handle")
        })?;

        let request = serde_json::json!({
            "op": "subscribe",
            "args": [{"channel": "tickers", "instId": venue_symbol}],
        });
        ws.send(Message::Text(request.to_string()))
            .await
            .map_err(|e| ExchangeError::transport(EXCHANGE_ID, e))?;

        self.subscription = Some(Subscription {
            symbol: symbol.to_string(),
            venue_symbol,
            quote,
            market_type,
        });
        Ok(())
    }

    async fn next_tick(&mut self) -> Result<Tick, ExchangeError> {
        let (sub_symbol, sub_venue, sub_quote, sub_market) = match &self.subscription {
            Some(sub) => (
                sub.symbol.clone(),
                sub.venue_symbol.clone(),
                sub.quote.clone(),
                sub.market_type,
            ),
            None => {
                return Err(ExchangeError::protocol(
                    EXCHANGE_ID,
                    "next_tick called before subscribe",
                ))
            }
        };
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
                    if text == "pong" {
                        continue;
                    }
                    // Subscribe acks and error events fail this parse and
                    // are skipped
                    let event: TickerPush = match serde_json::from_str(&text) {
                        Ok(ev) => ev,
                        Err(_) => continue,
                    };
                    if event.arg.channel != "tickers" || event.arg.inst_id != sub_venue {
                        continue;
                    }
                    let Some(ticker) = event.data.into_iter().next() else {
                        continue;
                    };
                    return Ok(Tick {
                        exchange_id: EXCHANGE_ID.to_string(),
                        symbol: sub_symbol,
                        market_type: sub_market,
                        quote: sub_quote,
                        last: lenient_f64(&ticker.last),
                        bid: lenient_f64(&ticker.bid_px),
                        ask: lenient_f64(&ticker.ask_px),
                        base_volume: lenient_f64(&ticker.vol_24h),
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
                let url = format!("{}/public/time", REST_URL);
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
                ws.send(Message::Text("ping".to_string()))
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

/// Standard OKX response envelope
#[derive(Debug, Deserialize)]
struct OkxResponse<T> {
    code: String,
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OkxInstrument {
    #[allow(dead_code)]
    inst_id: String,
    #[serde(default)]
    base_ccy: String,
    #[serde(default)]
    quote_ccy: String,
    #[serde(default)]
    uly: String,
    #[serde(default)]
    settle_ccy: String,
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OkxTicker {
    last: String,
    bid_px: String,
    ask_px: String,
    vol_24h: String,
}

#[derive(Debug, Deserialize)]
struct TickerPushArg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Debug, Deserialize)]
struct TickerPush {
    arg: TickerPushArg,
    data: Vec<OkxTicker>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_conversion() {
        let connector = OkxConnector::new();
        assert_eq!(connector.to_venue_symbol("BTC/USDT"), "BTC-USDT");
        assert_eq!(connector.to_venue_symbol("BTC/USDT:USDT"), "BTC-USDT-SWAP");
    }

    #[test]
    fn test_parse_canonical() {
        assert_eq!(
            parse_canonical("ETH/USDT"),
            Some(("ETH", "USDT", MarketType::Spot))
        );
        assert_eq!(
            parse_canonical("ETH/USDT:USDT"),
            Some(("ETH", "USDT", MarketType::Swap))
        );
        assert_eq!(parse_canonical("ETHUSDT"), None);
    }

    #[test]
    fn test_ticker_push_parse() {
        let raw = r#"{"arg":{"channel":"tickers","instId":"BTC-USDT"},"data":[{"instId":"BTC-USDT","last":"50000.1","bidPx":"49999.9","askPx":"50000.3","vol24h":"1234.5","ts":"1700000000000"}]}"#;
        let push: TickerPush = serde_json::from_str(raw).unwrap();
        assert_eq!(push.arg.inst_id, "BTC-USDT");
        assert_eq!(lenient_f64(&push.data[0].bid_px), 49999.9);
    }

    #[test]
    fn test_subscribe_ack_is_not_a_push() {
        let raw = r#"{"event":"subscribe","arg":{"channel":"tickers","instId":"BTC-USDT"}}"#;
        assert!(serde_json::from_str::<TickerPush>(raw).is_err());
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_load_catalog() {
        let connector = OkxConnector::new();
        let catalog = connector.load_catalog().await.unwrap();
        assert!(catalog.iter().any(|i| i.symbol == "BTC/USDT" && i.active));
        assert!(catalog.iter().any(|i| i.market_type == MarketType::Swap));
    }
}
