//! A `Message` is the unit of retransmission: a single datagram that expects an acknowledgment,
//!  together with the timer task that re-sends it until the acknowledgment arrives.

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};
use crate::config::RudpConfig;
use crate::seq_num::SeqNum;
use crate::send_pipeline::SendPipeline;

/// Receives the events of a message's retransmission timer. This is implemented by the
///  connection that owns the message.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RetransmissionObserver: Send + Sync + 'static {
    /// called after every re-send, `retries` starting at 1
    async fn on_retransmit(&self, expected_ack: SeqNum, retries: u32);

    /// called when the retry ceiling is reached without an acknowledgment
    async fn on_exhausted(&self, expected_ack: SeqNum, retries: u32);
}

/// Backoff state of a single message: the timeout starts at the base value and doubles on every
///  re-send, starting over at the base value when doubling would exceed the maximum.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    timeout: Duration,
    retries: u32,

    config_base_timeout: Duration,
    config_max_timeout: Duration,
    config_max_retries: u32,
}

impl RetransmitTimer {
    pub fn new(config: &RudpConfig) -> RetransmitTimer {
        RetransmitTimer {
            timeout: config.base_retransmit_timeout,
            retries: 0,
            config_base_timeout: config.base_retransmit_timeout,
            config_max_timeout: config.max_retransmit_timeout,
            config_max_retries: config.max_retransmissions,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_exhausted(&self) -> bool {
        self.retries >= self.config_max_retries
    }

    /// registers a re-send, returning the updated retry count
    pub fn on_resend(&mut self) -> u32 {
        self.retries += 1;

        let doubled = self.timeout * 2;
        self.timeout = if doubled > self.config_max_timeout {
            self.config_base_timeout
        }
        else {
            doubled
        };
        self.retries
    }
}

pub struct Message {
    datagram: Bytes,
    expected_ack: SeqNum,
    acknowledged: bool,
    timer_handle: Option<JoinHandle<()>>,
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
        }
    }
}

impl Message {
    pub fn new(datagram: Bytes, expected_ack: SeqNum) -> Message {
        Message {
            datagram,
            expected_ack,
            acknowledged: false,
            timer_handle: None,
        }
    }

    pub fn expected_ack(&self) -> SeqNum {
        self.expected_ack
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn datagram(&self) -> &Bytes {
        &self.datagram
    }

    /// Marks the message as acknowledged and cancels its retransmission timer
    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
        }
    }

    /// sends the datagram once, without retransmission
    pub async fn send(&self, pipeline: &SendPipeline, to: SocketAddr) {
        pipeline.do_send_packet(to, &self.datagram).await;
    }

    /// Sends the datagram and starts a timer task that keeps re-sending it until the message
    ///  is acknowledged (or dropped), or the retry ceiling is reached.
    pub async fn send_with_timer(
        &mut self,
        pipeline: Arc<SendPipeline>,
        to: SocketAddr,
        timer: RetransmitTimer,
        observer: Weak<dyn RetransmissionObserver>,
    ) {
        if self.acknowledged {
            debug!("message for ack {} is already acknowledged - not sending", self.expected_ack);
            return;
        }

        pipeline.do_send_packet(to, &self.datagram).await;

        if let Some(prev) = self.timer_handle.take() {
            prev.abort();
        }
        self.timer_handle = Some(tokio::spawn(Self::retransmit_loop(
            pipeline,
            to,
            self.datagram.clone(),
            self.expected_ack,
            timer,
            observer,
        )));
    }

    async fn retransmit_loop(
        pipeline: Arc<SendPipeline>,
        to: SocketAddr,
        datagram: Bytes,
        expected_ack: SeqNum,
        mut timer: RetransmitTimer,
        observer: Weak<dyn RetransmissionObserver>,
    ) {
        loop {
            time::sleep(timer.timeout()).await;

            if timer.is_exhausted() {
                warn!("no ack {} from {:?} after {} retransmissions - giving up", expected_ack, to, timer.retries());
                if let Some(observer) = observer.upgrade() {
                    // the observer typically drops this message, aborting this task - so the
                    //  notification must not run inside it
                    let retries = timer.retries();
                    tokio::spawn(async move {
                        observer.on_exhausted(expected_ack, retries).await;
                    });
                }
                return;
            }

            trace!("re-sending packet for ack {} to {:?}", expected_ack, to);
            pipeline.do_send_packet(to, &datagram).await;
            let retries = timer.on_resend();

            match observer.upgrade() {
                Some(observer) => observer.on_retransmit(expected_ack, retries).await,
                None => {
                    debug!("connection for ack {} is gone - stopping retransmission", expected_ack);
                    return;
                }
            }
        }
    }
}
