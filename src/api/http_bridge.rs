//! JSON-over-HTTP gateway to a broker terminal bridge.
//!
//! The bridge runs next to the terminal and exposes its trading functions:
//!
//! - `POST /connect`
//! - `GET  /bars?symbol=..&timeframe=..&count=..`
//! - `GET  /account`
//! - `POST /orders`
//! - `POST /positions/{ticket}/modify`
//! - `POST /positions/{ticket}/close`
//! - `GET  /positions[?symbol=..]`
//!
//! Requests carry a bearer token when one is configured.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::gateway::BrokerGateway;
use super::types::*;
use crate::error::GatewayError;
use crate::models::{AccountSnapshot, Direction, PriceBar, Timeframe};
use crate::trading::GatewaySettings;

/// Tag the bridge attaches to orders placed by this engine.
const ORDER_COMMENT: &str = "splitleg";

/// Gateway backed by the terminal bridge's HTTP API.
pub struct HttpGateway {
    client: Client,
    base_url: String,
    token: Option<String>,
    timeout_secs: u64,
}

impl HttpGateway {
    pub fn new(settings: &GatewaySettings, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token,
            timeout_secs: settings.timeout_secs,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("invalid response body: {e}")))
    }
}

fn transport_error(err: reqwest::Error, timeout_secs: u64) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(timeout_secs)
    } else if err.is_connect() || err.is_request() {
        GatewayError::Disconnected(err.to_string())
    } else {
        GatewayError::Protocol(err.to_string())
    }
}

/// Map a non-success HTTP status to a gateway error.
fn status_error(status: StatusCode, body: &str) -> GatewayError {
    match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound(body.to_string()),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            GatewayError::Disconnected(format!("{status}: {body}"))
        }
        StatusCode::GATEWAY_TIMEOUT => GatewayError::Disconnected(format!("terminal timeout: {body}")),
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
            GatewayError::OrderRejected(body.to_string())
        }
        _ => GatewayError::Protocol(format!("{status}: {body}")),
    }
}

fn ack(resp: AckResponse, what: &str) -> Result<(), GatewayError> {
    if resp.success {
        Ok(())
    } else {
        Err(GatewayError::Protocol(format!("{what} refused: {}", resp.message)))
    }
}

#[async_trait]
impl BrokerGateway for HttpGateway {
    async fn connect(&self) -> Result<ConnectionHandle, GatewayError> {
        let handle: ConnectionHandle = self.fetch(self.client.post(self.url("/connect"))).await?;
        debug!(session = %handle.session_id, server = %handle.server, "Terminal session established");
        Ok(handle)
    }

    async fn get_price_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<PriceBar>, GatewayError> {
        let request = self.client.get(self.url("/bars")).query(&[
            ("symbol", symbol.to_string()),
            ("timeframe", timeframe.as_str().to_string()),
            ("count", count.to_string()),
        ]);
        let raw: Vec<BarResponse> = self.fetch(request).await?;

        let received = raw.len();
        let bars: Vec<PriceBar> = raw.into_iter().filter_map(BarResponse::into_bar).collect();
        if bars.len() < received {
            warn!(
                symbol = %symbol,
                dropped = received - bars.len(),
                "Dropped bars with invalid timestamps"
            );
        }
        Ok(bars)
    }

    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, GatewayError> {
        let account: AccountResponse = self.fetch(self.client.get(self.url("/account"))).await?;
        Ok(account.into())
    }

    async fn place_order(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: Decimal,
        kind: OrderKind,
        stop: Decimal,
        take_profit: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        let body = OrderRequest {
            symbol,
            direction,
            volume: quantity,
            kind,
            stop_loss: stop,
            take_profit,
            comment: ORDER_COMMENT,
        };
        let resp: OrderResponse = self
            .fetch(self.client.post(self.url("/orders")).json(&body))
            .await?;

        if !resp.success {
            return Err(GatewayError::OrderRejected(format!(
                "retcode {}: {}",
                resp.retcode.unwrap_or_default(),
                resp.message
            )));
        }
        match (resp.ticket, resp.price) {
            (Some(ticket), Some(fill_price)) => Ok(OrderRef {
                ticket,
                fill_price,
                filled_quantity: resp.volume.unwrap_or(quantity),
            }),
            _ => Err(GatewayError::Protocol(
                "order accepted without ticket or price".to_string(),
            )),
        }
    }

    async fn modify_position(
        &self,
        ticket: u64,
        stop: Decimal,
        take_profit: Decimal,
    ) -> Result<(), GatewayError> {
        let body = ModifyRequest {
            stop_loss: stop,
            take_profit,
        };
        let path = format!("/positions/{ticket}/modify");
        let resp: AckResponse = self.fetch(self.client.post(self.url(&path)).json(&body)).await?;
        ack(resp, "modify")
    }

    async fn close_position(&self, ticket: u64, quantity: Decimal) -> Result<(), GatewayError> {
        let body = CloseRequest { volume: quantity };
        let path = format!("/positions/{ticket}/close");
        let resp: AckResponse = self.fetch(self.client.post(self.url(&path)).json(&body)).await?;
        ack(resp, "close")
    }

    async fn get_open_positions(
        &self,
        filter: &PositionFilter,
    ) -> Result<Vec<PositionRef>, GatewayError> {
        let mut request = self.client.get(self.url("/positions"));
        if let Some(symbol) = &filter.symbol {
            request = request.query(&[("symbol", symbol)]);
        }
        self.fetch(request).await
    }
}
