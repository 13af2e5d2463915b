//! 同步服务驱动层
//!
//! 把同步引擎接到 tokio 运行时：信封经 mpsc 进入，定时用
//! `sleep_until(next_deadline)` 驱动，引擎排队的请求描述符逐个
//! spawn 到传输层执行，响应回灌后继续派发。引擎的全部变更都在
//! `parking_lot::Mutex` 里串行完成，锁从不跨越 await 点。

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{debug, info};

use crate::protocol::UpdateEnvelope;
use crate::store::ObjectStore;
use crate::sync::coordinator::PendingRequest;
use crate::sync::engine::SyncEngine;
use crate::transport::Transport;

/// 空闲时的兜底唤醒间隔
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// 同步服务
pub struct SyncService<S: ObjectStore + Send + 'static> {
    engine: Arc<Mutex<SyncEngine<S>>>,
    transport: Arc<dyn Transport>,
    envelope_rx: mpsc::Receiver<UpdateEnvelope>,
    wakeup: Arc<Notify>,
}

impl<S: ObjectStore + Send + 'static> SyncService<S> {
    /// 包装引擎并返回信封入口；sender 全部 drop 后 `run` 退出
    pub fn new(
        engine: SyncEngine<S>,
        transport: Arc<dyn Transport>,
        queue_capacity: usize,
    ) -> (Self, mpsc::Sender<UpdateEnvelope>) {
        let (envelope_tx, envelope_rx) = mpsc::channel(queue_capacity);
        let service = Self {
            engine: Arc::new(Mutex::new(engine)),
            transport,
            envelope_rx,
            wakeup: Arc::new(Notify::new()),
        };
        (service, envelope_tx)
    }

    /// 引擎句柄（初始化状态、订阅事件、测试断言）
    pub fn engine(&self) -> Arc<Mutex<SyncEngine<S>>> {
        self.engine.clone()
    }

    /// 驱动循环，信封通道关闭时返回
    pub async fn run(mut self) {
        info!("同步服务启动");
        loop {
            let deadline = self
                .engine
                .lock()
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);

            tokio::select! {
                maybe = self.envelope_rx.recv() => {
                    match maybe {
                        Some(envelope) => {
                            self.engine.lock().handle_envelope(envelope, Instant::now());
                        }
                        None => break,
                    }
                }
                _ = sleep_until(TokioInstant::from_std(deadline)) => {
                    self.engine.lock().handle_time(Instant::now());
                }
                _ = self.wakeup.notified() => {}
            }
            Self::dispatch(&self.engine, &self.transport, &self.wakeup);
        }
        info!("同步服务退出");
    }

    /// 取走引擎排队的请求并逐个执行；响应回灌可能再排队新请求
    /// （Slice 续拉、非 final 频道续拉、失败退避），任务末尾递归派发
    fn dispatch(
        engine: &Arc<Mutex<SyncEngine<S>>>,
        transport: &Arc<dyn Transport>,
        wakeup: &Arc<Notify>,
    ) {
        let pending = engine.lock().take_pending_requests();
        for request in pending {
            debug!("派发同步请求: {:?}", request);
            let engine = engine.clone();
            let transport = transport.clone();
            let wakeup = wakeup.clone();
            tokio::spawn(async move {
                match request {
                    PendingRequest::FullDifference { pts, qts, date } => {
                        let result = transport.request_full_difference(pts, qts, date).await;
                        {
                            let mut engine = engine.lock();
                            match result {
                                Ok(difference) => {
                                    engine.apply_difference(difference, Instant::now())
                                }
                                Err(error) => engine.fail_difference(error, Instant::now()),
                            }
                        }
                        Self::dispatch(&engine, &transport, &wakeup);
                        // 退避期限等新定时要叫醒主循环重算 sleep
                        wakeup.notify_one();
                    }
                    PendingRequest::ChannelDifference {
                        channel_id,
                        pts,
                        force,
                        limit,
                    } => {
                        let result = transport
                            .request_channel_difference(channel_id, pts, force, limit)
                            .await;
                        {
                            let mut engine = engine.lock();
                            match result {
                                Ok(difference) => engine.apply_channel_difference(
                                    channel_id,
                                    difference,
                                    Instant::now(),
                                ),
                                Err(error) => engine.fail_channel_difference(
                                    channel_id,
                                    error,
                                    Instant::now(),
                                ),
                            }
                        }
                        Self::dispatch(&engine, &transport, &wakeup);
                        wakeup.notify_one();
                    }
                    PendingRequest::LivenessProbe => {
                        transport.send_liveness_probe().await;
                    }
                }
            });
        }
    }
}
