//! Submission lifecycle controller.
//!
//! Owns the selected file, the upload, the progress clock and the status poll loop.
//! All state lives in a single task; presentation layers talk to it through
//! `ControllerHandle` and read published `Snapshot`s.

use crate::backend::{ServiceError, StatusService, UploadService};
use crate::model::{
    ControllerConfig, ControllerEvent, JobHandle, JobStatus, Phase, ProgressEstimate, Snapshot,
    StatusResponse, Submission, UploadResponse,
};
use crate::progress::ProgressClock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub(crate) const MISSING_ID_REASON: &str = "upload succeeded but no scan ID received";
pub(crate) const MISSING_RESULT_REASON: &str =
    "processing completed, but no prediction results found";
pub(crate) const TIMED_OUT_MESSAGE: &str = "processing taking too long, please try again later";
/// Shortest progress tick; `tokio::time::interval` rejects a zero period.
pub(crate) const MIN_PROGRESS_TICK: Duration = Duration::from_millis(1);

/// Commands emitted by presentation layers.
#[derive(Debug)]
enum Command {
    SelectFile(Submission),
    Clear,
    Submit,
}

#[derive(Debug)]
enum TaskOutcome {
    Uploaded(Result<UploadResponse, ServiceError>),
    Polled(Result<StatusResponse, ServiceError>),
}

/// Result of a background request, tagged with the generation it was started under.
#[derive(Debug)]
struct TaskMessage {
    generation: u64,
    outcome: TaskOutcome,
}

/// The two backend collaborators.
#[derive(Clone)]
pub(crate) struct Services {
    pub upload: Arc<dyn UploadService>,
    pub status: Arc<dyn StatusService>,
}

impl Services {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UploadService + StatusService + 'static,
    {
        Self {
            upload: backend.clone(),
            status: backend,
        }
    }
}

/// Cheap, cloneable front door to a running controller.
#[derive(Clone)]
pub(crate) struct ControllerHandle {
    cmd_tx: UnboundedSender<Command>,
    state_rx: watch::Receiver<Snapshot>,
}

impl ControllerHandle {
    /// Replace the current submission. Cancels any upload or polling in progress.
    pub fn select_file(&self, submission: Submission) {
        let _ = self.cmd_tx.send(Command::SelectFile(submission));
    }

    /// Drop the submission and all derived state. Safe in any phase.
    pub fn clear(&self) {
        let _ = self.cmd_tx.send(Command::Clear);
    }

    /// Start uploading the selected file. Ignored unless a file is selected and
    /// the controller is `Idle` or `Failed`.
    pub fn submit(&self) {
        let _ = self.cmd_tx.send(Command::Submit);
    }

    pub fn current_state(&self) -> Snapshot {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state_rx.clone()
    }
}

struct Receivers {
    cmd_rx: UnboundedReceiver<Command>,
    task_rx: UnboundedReceiver<TaskMessage>,
}

struct SubmissionController {
    cfg: ControllerConfig,
    services: Services,
    state: Snapshot,
    state_tx: watch::Sender<Snapshot>,
    event_tx: Option<UnboundedSender<ControllerEvent>>,
    task_tx: UnboundedSender<TaskMessage>,
    // Bumped whenever outstanding work must be ignored.
    generation: u64,
    clock: Option<ProgressClock>,
    in_flight: Option<JoinHandle<()>>,
    next_poll_at: Option<Instant>,
}

/// Spawn the controller task. It exits once every handle has been dropped.
pub(crate) fn spawn_controller(
    cfg: ControllerConfig,
    services: Services,
    event_tx: Option<UnboundedSender<ControllerEvent>>,
) -> (ControllerHandle, JoinHandle<()>) {
    let (controller, handle, receivers) = SubmissionController::new(cfg, services, event_tx);
    let join = tokio::spawn(controller.run(receivers));
    (handle, join)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => futures::future::pending().await,
    }
}

impl SubmissionController {
    fn new(
        cfg: ControllerConfig,
        services: Services,
        event_tx: Option<UnboundedSender<ControllerEvent>>,
    ) -> (Self, ControllerHandle, Receivers) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(Snapshot::default());
        let controller = Self {
            cfg,
            services,
            state: Snapshot::default(),
            state_tx,
            event_tx,
            task_tx,
            generation: 0,
            clock: None,
            in_flight: None,
            next_poll_at: None,
        };
        (
            controller,
            ControllerHandle { cmd_tx, state_rx },
            Receivers { cmd_rx, task_rx },
        )
    }

    async fn run(mut self, receivers: Receivers) {
        let Receivers {
            mut cmd_rx,
            mut task_rx,
        } = receivers;
        let mut ticker = tokio::time::interval(self.cfg.progress_tick.max(MIN_PROGRESS_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let processing = self.state.phase == Phase::Processing;
            let poll_deadline = self.next_poll_at;
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(msg) = task_rx.recv() => self.handle_task(msg),
                _ = ticker.tick(), if processing => self.tick_progress(),
                _ = sleep_until_opt(poll_deadline) => self.start_poll(),
            }
        }

        self.cancel_pending();
        tracing::debug!("submission controller stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SelectFile(submission) => {
                tracing::info!(
                    file = %submission.file_name,
                    bytes = submission.size_bytes,
                    mime = %submission.mime_type,
                    "file selected"
                );
                let name = submission.file_name.clone();
                self.reset();
                self.state.submission = Some(submission);
                self.publish();
                self.emit(ControllerEvent::Info(format!("Selected {name}")));
            }
            Command::Clear => {
                tracing::debug!("clearing submission");
                self.reset();
                self.publish();
            }
            Command::Submit => self.submit(),
        }
    }

    /// Invalidate outstanding work and return to an empty `Idle` state.
    fn reset(&mut self) {
        self.cancel_pending();
        self.generation += 1;
        let was_idle = self.state.phase == Phase::Idle;
        self.state = Snapshot::default();
        if !was_idle {
            self.emit(ControllerEvent::PhaseChanged { phase: Phase::Idle });
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
        self.next_poll_at = None;
        self.clock = None;
    }

    fn submit(&mut self) {
        let can_submit = matches!(self.state.phase, Phase::Idle | Phase::Failed { .. });
        let Some(submission) = self.state.submission.clone().filter(|_| can_submit) else {
            tracing::debug!(phase = ?self.state.phase, "submit ignored");
            return;
        };

        self.cancel_pending();
        self.generation += 1;
        self.state.job = None;
        self.state.result = None;
        self.state.error = None;
        self.state.poll_attempts = 0;
        self.state.backend_status = None;
        self.state.progress = ProgressEstimate::new(0, "Uploading scan");
        self.transition(Phase::Uploading);

        let generation = self.generation;
        let upload = self.services.upload.clone();
        let task_tx = self.task_tx.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let res = upload.upload(&submission).await;
            let _ = task_tx.send(TaskMessage {
                generation,
                outcome: TaskOutcome::Uploaded(res),
            });
        }));
    }

    fn handle_task(&mut self, msg: TaskMessage) {
        if msg.generation != self.generation {
            tracing::debug!(
                stale = msg.generation,
                current = self.generation,
                "dropping stale task result"
            );
            return;
        }
        self.in_flight = None;

        match msg.outcome {
            TaskOutcome::Uploaded(res) => self.on_uploaded(res),
            TaskOutcome::Polled(res) => self.on_polled(res),
        }
    }

    fn on_uploaded(&mut self, res: Result<UploadResponse, ServiceError>) {
        if self.state.phase != Phase::Uploading {
            return;
        }
        let resp = match res {
            Ok(resp) => resp,
            Err(e) => {
                self.fail(e.to_string());
                return;
            }
        };
        tracing::debug!(
            message = ?resp.message,
            created_at = ?resp.created_at,
            "upload response"
        );
        let Some(id) = resp.id.filter(|id| !id.trim().is_empty()) else {
            self.fail(MISSING_ID_REASON.to_string());
            return;
        };

        let job = JobHandle::new(id);
        tracing::info!(job_id = %job.id, "upload accepted");
        let clock = ProgressClock::new(self.cfg.min_processing);
        self.state.progress = clock.current().clone();
        self.clock = Some(clock);
        self.next_poll_at = Some(job.created_at + self.cfg.min_processing);
        self.state.job = Some(job);
        self.state.poll_attempts = 0;
        self.state.backend_status = resp.status;
        self.transition(Phase::Processing);
    }

    fn tick_progress(&mut self) {
        let (Some(clock), Some(job)) = (self.clock.as_mut(), self.state.job.as_ref()) else {
            return;
        };
        let estimate = clock.advance(job.created_at.elapsed()).clone();
        if estimate != self.state.progress {
            self.state.progress = estimate.clone();
            self.publish();
            self.emit(ControllerEvent::Progress(estimate));
        }
    }

    fn start_poll(&mut self) {
        self.next_poll_at = None;
        if self.state.phase != Phase::Processing || self.in_flight.is_some() {
            return;
        }
        let Some(job_id) = self.state.job.as_ref().map(|j| j.id.clone()) else {
            return;
        };
        tracing::debug!(
            %job_id,
            attempt = self.state.poll_attempts + 1,
            max = self.cfg.max_poll_attempts,
            "polling for results"
        );

        let generation = self.generation;
        let status = self.services.status.clone();
        let task_tx = self.task_tx.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let res = status.get_status(&job_id).await;
            let _ = task_tx.send(TaskMessage {
                generation,
                outcome: TaskOutcome::Polled(res),
            });
        }));
    }

    fn on_polled(&mut self, res: Result<StatusResponse, ServiceError>) {
        if self.state.phase != Phase::Processing {
            return;
        }
        let resp = match res {
            Ok(resp) => resp,
            Err(e) => {
                self.fail(format!("failed to fetch results: {e}"));
                return;
            }
        };
        tracing::debug!(
            status = resp.status.as_str(),
            progress = ?resp.progress,
            created_at = ?resp.created_at,
            "status response"
        );
        self.state.backend_status = Some(resp.status.as_str().to_string());

        match resp.status {
            JobStatus::Completed => match resp.prediction().cloned() {
                Some(prediction) => {
                    tracing::info!(
                        class = %prediction.predicted_class,
                        confidence = prediction.confidence,
                        "prediction received"
                    );
                    let mut clock = self
                        .clock
                        .take()
                        .unwrap_or_else(|| ProgressClock::new(self.cfg.min_processing));
                    self.state.progress = clock.complete().clone();
                    self.cancel_pending();
                    self.state.result = Some(prediction);
                    self.transition(Phase::Completed);
                }
                None => self.fail(MISSING_RESULT_REASON.to_string()),
            },
            JobStatus::Error => {
                let detail = resp.error.as_deref().unwrap_or("unknown error");
                self.fail(format!("backend reported an error: {detail}"));
            }
            JobStatus::Processing | JobStatus::Unknown => {
                self.state.poll_attempts += 1;
                let attempt = self.state.poll_attempts;
                self.emit(ControllerEvent::PollAttempt {
                    attempt,
                    max: self.cfg.max_poll_attempts,
                    status: resp.status.as_str().to_string(),
                });
                if attempt >= self.cfg.max_poll_attempts {
                    tracing::warn!(attempts = attempt, "max polling attempts reached");
                    self.cancel_pending();
                    self.state.error = Some(TIMED_OUT_MESSAGE.to_string());
                    self.transition(Phase::TimedOut);
                } else {
                    self.next_poll_at = Some(Instant::now() + self.cfg.poll_interval);
                    self.publish();
                }
            }
        }
    }

    fn fail(&mut self, reason: String) {
        tracing::warn!(%reason, "submission failed");
        self.cancel_pending();
        self.state.error = Some(reason.clone());
        self.transition(Phase::Failed { reason });
    }

    fn transition(&mut self, phase: Phase) {
        tracing::info!(from = self.state.phase.label(), to = phase.label(), "phase change");
        self.state.phase = phase.clone();
        self.publish();
        self.emit(ControllerEvent::PhaseChanged { phase });
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn emit(&self, ev: ControllerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PredictionResult, StatusResults};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    const MIN: Duration = Duration::from_secs(16);
    const INTERVAL: Duration = Duration::from_secs(5);

    enum UploadStep {
        Id(&'static str),
        NoId,
        Fail(&'static str),
    }

    #[derive(Default)]
    struct StubUpload {
        script: Mutex<VecDeque<UploadStep>>,
        calls: Mutex<u32>,
    }

    impl StubUpload {
        fn scripted(steps: Vec<UploadStep>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl UploadService for StubUpload {
        async fn upload(&self, _submission: &Submission) -> Result<UploadResponse, ServiceError> {
            *self.calls.lock().unwrap() += 1;
            let step = self.script.lock().unwrap().pop_front().unwrap_or(UploadStep::Id("job-1"));
            match step {
                UploadStep::Id(id) => Ok(UploadResponse {
                    message: Some("File uploaded successfully".into()),
                    status: Some("processing".into()),
                    id: Some(id.into()),
                    created_at: None,
                }),
                UploadStep::NoId => Ok(UploadResponse {
                    message: None,
                    status: Some("processing".into()),
                    id: None,
                    created_at: None,
                }),
                UploadStep::Fail(detail) => Err(ServiceError::Status {
                    code: 503,
                    detail: Some(detail.into()),
                }),
            }
        }
    }

    /// Scripted status responses; falls back to `processing` once the script runs out.
    #[derive(Default)]
    struct StubStatus {
        script: Mutex<VecDeque<Result<StatusResponse, ServiceError>>>,
        calls: Mutex<Vec<Instant>>,
        gate: Option<(UnboundedSender<()>, Arc<Notify>)>,
    }

    impl StubStatus {
        fn scripted(steps: Vec<Result<StatusResponse, ServiceError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusService for StubStatus {
        async fn get_status(&self, _job_id: &str) -> Result<StatusResponse, ServiceError> {
            self.calls.lock().unwrap().push(Instant::now());
            if let Some((started, release)) = &self.gate {
                let _ = started.send(());
                release.notified().await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(processing()))
        }
    }

    fn processing() -> StatusResponse {
        StatusResponse {
            status: JobStatus::Processing,
            progress: Some(40.0),
            results: None,
            error: None,
            created_at: Some("2024-01-01T00:00:00".into()),
        }
    }

    fn glioma() -> PredictionResult {
        PredictionResult {
            predicted_class: "glioma".into(),
            confidence: 0.92,
            all_probabilities: [
                ("glioma", 0.92),
                ("meningioma", 0.05),
                ("notumor", 0.02),
                ("pituitary", 0.01),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
            heatmap_url: None,
        }
    }

    fn completed(prediction: Option<PredictionResult>) -> StatusResponse {
        StatusResponse {
            status: JobStatus::Completed,
            progress: Some(100.0),
            results: prediction.map(|p| StatusResults {
                prediction: Some(p),
            }),
            error: None,
            created_at: None,
        }
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            min_processing: MIN,
            poll_interval: INTERVAL,
            progress_tick: Duration::from_millis(300),
            max_poll_attempts: 60,
            ..Default::default()
        }
    }

    fn scan() -> Submission {
        Submission::from_bytes("brain.png", vec![1u8, 2, 3])
    }

    fn start(
        upload: Arc<StubUpload>,
        status: Arc<StubStatus>,
    ) -> (ControllerHandle, UnboundedReceiver<ControllerEvent>) {
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let services = Services { upload, status };
        let (handle, _join) = spawn_controller(config(), services, Some(evt_tx));
        (handle, evt_rx)
    }

    async fn wait_until(handle: &ControllerHandle, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
        let mut rx = handle.subscribe();
        let fut = async {
            let snap = rx.wait_for(|s| pred(s)).await.expect("controller stopped");
            Snapshot::clone(&snap)
        };
        tokio::time::timeout(Duration::from_secs(3600), fut)
            .await
            .expect("state never reached")
    }

    fn is_failed(s: &Snapshot) -> bool {
        matches!(s.phase, Phase::Failed { .. })
    }

    #[tokio::test(start_paused = true)]
    async fn upload_enters_processing_without_polling() {
        let upload = StubUpload::scripted(vec![]);
        let status = StubStatus::scripted(vec![]);
        let (handle, _events) = start(upload.clone(), status.clone());

        handle.select_file(scan());
        handle.submit();
        let snap = wait_until(&handle, |s| s.phase == Phase::Processing).await;

        assert_eq!(snap.job.as_ref().unwrap().id, "job-1");
        assert_eq!(snap.poll_attempts, 0);
        assert!(snap.progress.percent < 100);
        assert!(status.calls().is_empty());
        assert_eq!(upload.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_waits_for_minimum_processing_time() {
        let status = StubStatus::scripted(vec![Ok(processing())]);
        let (handle, _events) = start(StubUpload::scripted(vec![]), status.clone());

        handle.select_file(scan());
        handle.submit();
        let processing = wait_until(&handle, |s| s.phase == Phase::Processing).await;
        let created = processing.job.unwrap().created_at;

        let snap = wait_until(&handle, |s| s.poll_attempts == 1).await;
        assert_eq!(snap.phase, Phase::Processing);
        assert_eq!(snap.backend_status.as_deref(), Some("processing"));

        let calls = status.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].duration_since(created) >= MIN);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_poll_stores_prediction_and_stops() {
        let status = StubStatus::scripted(vec![Ok(processing()), Ok(completed(Some(glioma())))]);
        let (handle, mut events) = start(StubUpload::scripted(vec![]), status.clone());

        handle.select_file(scan());
        handle.submit();
        let snap = wait_until(&handle, |s| s.phase.is_terminal()).await;

        assert_eq!(snap.phase, Phase::Completed);
        assert_eq!(snap.result.as_ref().unwrap().predicted_class, "glioma");
        assert_eq!(snap.progress.percent, 100);
        assert_eq!(snap.poll_attempts, 1);
        assert!(snap.error.is_none());

        tokio::time::sleep(Duration::from_secs(120)).await;
        let calls = status.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].duration_since(calls[0]) >= INTERVAL);

        let mut phases = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let ControllerEvent::PhaseChanged { phase } = ev {
                phases.push(phase);
            }
        }
        assert_eq!(phases, vec![Phase::Uploading, Phase::Processing, Phase::Completed]);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_without_prediction_fails() {
        let status = StubStatus::scripted(vec![Ok(completed(None))]);
        let (handle, _events) = start(StubUpload::scripted(vec![]), status);

        handle.select_file(scan());
        handle.submit();
        let snap = wait_until(&handle, |s| s.phase.is_terminal()).await;

        match &snap.phase {
            Phase::Failed { reason } => assert!(reason.contains("no prediction results")),
            other => panic!("unexpected phase {other:?}"),
        }
        assert!(snap.result.is_none());
        assert!(snap.job.is_some());
        assert_eq!(snap.poll_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn max_attempts_times_out_without_extra_poll() {
        let status = StubStatus::scripted(vec![]);
        let (handle, _events) = start(StubUpload::scripted(vec![]), status.clone());

        handle.select_file(scan());
        handle.submit();
        let snap = wait_until(&handle, |s| s.phase.is_terminal()).await;

        assert_eq!(snap.phase, Phase::TimedOut);
        assert_eq!(snap.poll_attempts, 60);
        assert!(snap.error.is_some());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(status.calls().len(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_mid_processing_drops_late_response() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let status = Arc::new(StubStatus {
            script: Mutex::new(vec![Ok(completed(Some(glioma())))].into()),
            gate: Some((started_tx, release.clone())),
            ..Default::default()
        });
        let (handle, _events) = start(StubUpload::scripted(vec![]), status.clone());

        handle.select_file(scan());
        handle.submit();
        started_rx.recv().await.expect("poll never issued");

        handle.clear();
        wait_until(&handle, |s| s.phase == Phase::Idle && s.submission.is_none()).await;
        release.notify_waiters();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let snap = handle.current_state();
        assert_eq!(snap.phase, Phase::Idle);
        assert!(snap.result.is_none());
        assert!(snap.job.is_none());
        assert_eq!(snap.poll_attempts, 0);
        assert_eq!(status.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_error_is_surfaced_verbatim() {
        let upload = StubUpload::scripted(vec![UploadStep::Fail("storage unavailable")]);
        let (handle, _events) = start(upload, StubStatus::scripted(vec![]));

        handle.select_file(scan());
        handle.submit();
        let snap = wait_until(&handle, is_failed).await;

        let reason = "HTTP error! status: 503 (storage unavailable)";
        assert_eq!(
            snap.phase,
            Phase::Failed {
                reason: reason.into()
            }
        );
        assert_eq!(snap.error.as_deref(), Some(reason));
        assert!(snap.job.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn upload_without_id_fails() {
        let upload = StubUpload::scripted(vec![UploadStep::NoId]);
        let (handle, _events) = start(upload, StubStatus::scripted(vec![]));

        handle.select_file(scan());
        handle.submit();
        let snap = wait_until(&handle, is_failed).await;
        assert_eq!(snap.error.as_deref(), Some(MISSING_ID_REASON));
        assert!(snap.job.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_transport_error_is_terminal() {
        let status = StubStatus::scripted(vec![Err(ServiceError::Status {
            code: 502,
            detail: Some("connection refused".into()),
        })]);
        let (handle, _events) = start(StubUpload::scripted(vec![]), status.clone());

        handle.select_file(scan());
        handle.submit();
        let snap = wait_until(&handle, is_failed).await;
        assert!(snap.error.unwrap().contains("connection refused"));
        assert_eq!(snap.poll_attempts, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(status.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backend_error_status_fails() {
        let mut resp = processing();
        resp.status = JobStatus::Error;
        resp.error = Some("model crashed".into());
        let status = StubStatus::scripted(vec![Ok(resp)]);
        let (handle, _events) = start(StubUpload::scripted(vec![]), status);

        handle.select_file(scan());
        handle.submit();
        let snap = wait_until(&handle, is_failed).await;
        assert_eq!(
            snap.error.as_deref(),
            Some("backend reported an error: model crashed")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn submit_without_file_or_while_busy_is_ignored() {
        let upload = StubUpload::scripted(vec![]);
        let (handle, _events) = start(upload.clone(), StubStatus::scripted(vec![]));

        handle.submit();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.current_state().phase, Phase::Idle);
        assert_eq!(upload.calls(), 0);

        handle.select_file(scan());
        handle.submit();
        wait_until(&handle, |s| s.phase == Phase::Processing).await;
        handle.submit();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(upload.calls(), 1);
        assert_eq!(handle.current_state().phase, Phase::Processing);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_after_failure_uploads_again() {
        let upload = StubUpload::scripted(vec![UploadStep::Fail("timeout"), UploadStep::Id("job-2")]);
        let (handle, _events) = start(upload.clone(), StubStatus::scripted(vec![]));

        handle.select_file(scan());
        handle.submit();
        wait_until(&handle, is_failed).await;

        handle.submit();
        let snap = wait_until(&handle, |s| s.phase == Phase::Processing).await;
        assert_eq!(snap.job.unwrap().id, "job-2");
        assert!(snap.error.is_none());
        assert_eq!(upload.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn selecting_new_file_supersedes_running_job() {
        let status = StubStatus::scripted(vec![Ok(completed(Some(glioma())))]);
        let (handle, _events) = start(StubUpload::scripted(vec![]), status.clone());

        handle.select_file(scan());
        handle.submit();
        wait_until(&handle, |s| s.phase == Phase::Processing).await;

        handle.select_file(Submission::from_bytes("second.dcm", vec![9u8]));
        let snap = wait_until(&handle, |s| {
            s.submission.as_ref().map(|f| f.file_name.as_str()) == Some("second.dcm")
        })
        .await;
        assert_eq!(snap.phase, Phase::Idle);
        assert!(snap.job.is_none());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(status.calls().is_empty());
        let snap = handle.current_state();
        assert_eq!(snap.phase, Phase::Idle);
        assert!(snap.result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_is_idempotent() {
        let (handle, _events) = start(StubUpload::scripted(vec![]), StubStatus::scripted(vec![]));
        handle.select_file(scan());
        handle.clear();
        handle.clear();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snap = handle.current_state();
        assert_eq!(snap.phase, Phase::Idle);
        assert!(snap.submission.is_none());
        assert!(snap.job.is_none());
        assert!(snap.result.is_none());
        assert!(snap.error.is_none());
        assert_eq!(snap.poll_attempts, 0);
        assert_eq!(snap.progress, ProgressEstimate::initial());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_never_decreases_while_processing() {
        let status = StubStatus::scripted(vec![Ok(processing()), Ok(completed(Some(glioma())))]);
        let (handle, _events) = start(StubUpload::scripted(vec![]), status);
        let mut rx = handle.subscribe();

        handle.select_file(scan());
        handle.submit();

        let mut seen = Vec::new();
        loop {
            rx.changed().await.expect("controller stopped");
            let snap = rx.borrow_and_update().clone();
            if snap.phase == Phase::Processing {
                let elapsed = snap.job.as_ref().unwrap().created_at.elapsed();
                if elapsed < MIN {
                    assert!(snap.progress.percent < 100);
                }
                seen.push(snap.progress.percent);
            }
            if snap.phase.is_terminal() {
                break;
            }
        }
        assert!(seen.len() > 10);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().all(|p| *p <= 100));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_progress_tick_still_runs_to_completion() {
        let status = StubStatus::scripted(vec![Ok(completed(Some(glioma())))]);
        let (evt_tx, _events) = mpsc::unbounded_channel();
        let services = Services {
            upload: StubUpload::scripted(vec![]),
            status,
        };
        let cfg = ControllerConfig {
            progress_tick: Duration::ZERO,
            ..config()
        };
        let (handle, join) = spawn_controller(cfg, services, Some(evt_tx));

        handle.select_file(scan());
        handle.submit();
        let snap = wait_until(&handle, |s| s.phase.is_terminal()).await;
        assert_eq!(snap.phase, Phase::Completed);
        assert!(!join.is_finished());
    }

    #[tokio::test]
    async fn stale_generation_is_ignored() {
        let services = Services {
            upload: StubUpload::scripted(vec![]),
            status: StubStatus::scripted(vec![]),
        };
        let (mut controller, handle, _receivers) = SubmissionController::new(config(), services, None);
        controller.state.submission = Some(scan());
        controller.state.job = Some(JobHandle::new("job-1".into()));
        controller.state.phase = Phase::Processing;
        controller.generation = 2;

        controller.handle_task(TaskMessage {
            generation: 1,
            outcome: TaskOutcome::Polled(Ok(completed(Some(glioma())))),
        });
        assert_eq!(controller.state.phase, Phase::Processing);
        assert!(controller.state.result.is_none());

        controller.handle_task(TaskMessage {
            generation: 2,
            outcome: TaskOutcome::Polled(Ok(completed(Some(glioma())))),
        });
        assert_eq!(controller.state.phase, Phase::Completed);
        assert_eq!(handle.current_state().phase, Phase::Completed);
    }
}
