//! Periscope: local camera viewer streaming to a remote detector over WebRTC

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::Result;
use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use winit::event_loop::{ControlFlow, EventLoop};

use periscope::capture::{CaptureLoop, V4l2Source};
use periscope::display::{OverlayStyle, UiEvent, Viewer, ViewerParts};
use periscope::pipeline::LatestValueChannel;
use periscope::session::ice::fetch_ice_servers;
use periscope::session::{MqttTransport, RtcConnector, SignalingSession, StatusSink};
use periscope::{utils, Config, Frame};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("periscope=info"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("Periscope launching...");

    let config_path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("PERISCOPE_CONFIG"))
        .map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("periscope-rt")
        .build()?;

    if let Some(url) = config.session.ice_config_url.clone() {
        match runtime.block_on(fetch_ice_servers(&url)) {
            Ok(servers) => {
                info!("Loaded {} ICE servers from {}", servers.len(), url);
                config.session.ice_servers.extend(servers);
            }
            Err(e) => warn!("Using configured ICE servers only: {}", e),
        }
    }

    let device_index = match config.capture.device_index {
        Some(index) => index,
        None => utils::auto_detect_device()?.index,
    };
    info!("Using capture device {}", device_index);

    // Capture -> network and network -> render hand-offs
    let outbound = Arc::new(LatestValueChannel::<Frame>::new());
    let inbound = Arc::new(LatestValueChannel::<Bytes>::new());
    let (render_tx, render_rx) = flume::bounded(config.capture.render_queue.max(1));

    let mut capture = CaptureLoop::new(
        Box::new(V4l2Source::new(config.capture.clone())),
        Arc::clone(&outbound),
        render_tx,
        &config.capture,
    );
    capture.open_device(device_index)?;

    let event_loop = EventLoop::<UiEvent>::with_user_event().build()?;
    let proxy = Mutex::new(event_loop.create_proxy());
    let status: StatusSink = Arc::new(move |status| {
        let _ = proxy.lock().send_event(UiEvent::Status(status));
    });

    let transport = {
        let _guard = runtime.enter();
        Arc::new(MqttTransport::connect(&config.session.broker))
    };
    let connector = Arc::new(RtcConnector::new(
        config.session.clone(),
        config.media.clone(),
    ));
    let session = SignalingSession::new(
        config.session.clone(),
        transport,
        connector,
        status,
        runtime.handle().clone(),
    );

    let session_tasks = session.tasks();
    let mut viewer = Viewer::new(ViewerParts {
        config: config.display.clone(),
        style: OverlayStyle::from_config(&config.overlay)?,
        device_index,
        frames: render_rx,
        outbound,
        inbound,
        capture,
        session,
    });

    event_loop.set_control_flow(ControlFlow::Poll);
    event_loop.run_app(&mut viewer)?;

    // Closes the session and releases the camera before the runtime goes away
    drop(viewer);
    session_tasks.close();
    if runtime
        .block_on(tokio::time::timeout(Duration::from_secs(2), session_tasks.wait()))
        .is_err()
    {
        warn!("Detection session did not shut down within 2s");
    }
    runtime.shutdown_timeout(Duration::from_secs(1));

    info!("Periscope shutting down");
    Ok(())
}
