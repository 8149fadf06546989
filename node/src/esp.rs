use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_graphics::{
    draw_target::DrawTarget,
    mono_font::{ascii::FONT_6X10, MonoTextStyle, MonoTextStyleBuilder},
    pixelcolor::BinaryColor,
    prelude::Point,
    text::Text,
    Drawable,
};
use embedded_svc::{
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
    },
    delay::Ets,
    gpio::{AnyIOPin, IOPin, Input, InputOutput, InterruptType, OutputPin, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use one_wire_bus::{Address, OneWire};
use ssd1306::{mode::BufferedGraphicsMode, prelude::*, I2CDisplayInterface, Ssd1306};

use frostwatch_common::{
    BrokerConfig, LinkAction, LinkHealth, LinkState, LinkSupervisor, NodeConfig, NodeTopics,
    SensorPayload, SensorReading, StatusBlinker, WifiConfig,
};

const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const LOOP_PERIOD_MS: u64 = 10;

// Button ISRs only touch these flags; the poll loop does everything else.
static BUTTON_RIGHT: AtomicBool = AtomicBool::new(false);
static BUTTON_DOWN: AtomicBool = AtomicBool::new(false);
static BUTTON_UP: AtomicBool = AtomicBool::new(false);
static BUTTON_PUSH: AtomicBool = AtomicBool::new(false);

type Oled<'d> = Ssd1306<
    I2CInterface<I2cDriver<'d>>,
    DisplaySize128x64,
    BufferedGraphicsMode<DisplaySize128x64>,
>;

struct StatusScreen<'d> {
    display: Oled<'d>,
    style: MonoTextStyle<'static, BinaryColor>,
}

impl<'d> StatusScreen<'d> {
    fn new(i2c: I2cDriver<'d>) -> anyhow::Result<Self> {
        let interface = I2CDisplayInterface::new(i2c);
        let mut display = Ssd1306::new(interface, DisplaySize128x64, DisplayRotation::Rotate0)
            .into_buffered_graphics_mode();
        display
            .init()
            .map_err(|err| anyhow!("display init failed: {err:?}"))?;

        let style = MonoTextStyleBuilder::new()
            .font(&FONT_6X10)
            .text_color(BinaryColor::On)
            .build();

        Ok(Self { display, style })
    }

    fn show_lines(&mut self, lines: &[&str]) -> anyhow::Result<()> {
        self.display.clear(BinaryColor::Off).ok();
        for (index, line) in lines.iter().enumerate() {
            Text::new(line, Point::new(0, 10 + index as i32 * 10), self.style)
                .draw(&mut self.display)
                .ok();
        }
        self.display
            .flush()
            .map_err(|err| anyhow!("display flush failed: {err:?}"))
    }

    fn render(&mut self, state: LinkState, reading: &SensorReading) -> anyhow::Result<()> {
        let status = match state {
            LinkState::Connected => "MQTT connected",
            LinkState::WifiUpBrokerDown => "Waiting for MQTT",
            LinkState::WifiDown => "Waiting for WiFi",
        };
        let temperature = format!("Temp = {:.2}", reading.temperature_c);
        let volts = format!("Volts = {:.2}", reading.supply_volts);

        self.display.clear(BinaryColor::Off).ok();
        Text::new(status, Point::new(0, 10), self.style)
            .draw(&mut self.display)
            .ok();
        Text::new(&temperature, Point::new(0, 30), self.style)
            .draw(&mut self.display)
            .ok();
        Text::new(&volts, Point::new(0, 40), self.style)
            .draw(&mut self.display)
            .ok();
        self.display
            .flush()
            .map_err(|err| anyhow!("display flush failed: {err:?}"))
    }

    fn set_power(&mut self, on: bool) -> anyhow::Result<()> {
        self.display
            .set_display_on(on)
            .map_err(|err| anyhow!("display power toggle failed: {err:?}"))
    }
}

struct TempProbe {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    delay: Ets,
}

impl TempProbe {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut probe = Self {
            one_wire,
            address: None,
            delay: Ets,
        };
        probe.refresh_address();
        Ok(probe)
    }

    fn refresh_address(&mut self) {
        let mut first_ds18: Option<Address> = None;
        let mut device_count = 0_u32;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if first_ds18.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        first_ds18 = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.address = first_ds18;

        if let Some(address) = self.address {
            info!(
                "DS18B20 ready ({} one-wire device(s), using {:?})",
                device_count, address
            );
        } else {
            warn!(
                "no DS18B20 found ({} one-wire device(s) detected)",
                device_count
            );
        }
    }

    // Blocking: holds the loop for the 12-bit conversion time.
    fn read_temperature_c(&mut self) -> Option<f32> {
        if self.address.is_none() {
            self.refresh_address();
        }

        let address = self.address?;
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {:?}: {err:?}", address);
                self.address = None;
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.address = None;
            return None;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => {
                info!("[DS18B20] Temperature: {:.2}°C", data.temperature);
                Some(data.temperature)
            }
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                None
            }
        }
    }
}

struct Buttons {
    right: PinDriver<'static, AnyIOPin, Input>,
    down: PinDriver<'static, AnyIOPin, Input>,
    up: PinDriver<'static, AnyIOPin, Input>,
    push: PinDriver<'static, AnyIOPin, Input>,
}

impl Buttons {
    fn new(
        right: AnyIOPin,
        down: AnyIOPin,
        up: AnyIOPin,
        push: AnyIOPin,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            right: Self::init_pin(right, &BUTTON_RIGHT)?,
            down: Self::init_pin(down, &BUTTON_DOWN)?,
            up: Self::init_pin(up, &BUTTON_UP)?,
            push: Self::init_pin(push, &BUTTON_PUSH)?,
        })
    }

    fn init_pin(
        pin: AnyIOPin,
        flag: &'static AtomicBool,
    ) -> anyhow::Result<PinDriver<'static, AnyIOPin, Input>> {
        let mut driver = PinDriver::input(pin)?;
        driver.set_pull(Pull::Up)?;
        driver.set_interrupt_type(InterruptType::NegEdge)?;
        unsafe { driver.subscribe(move || flag.store(true, Ordering::Relaxed))? };
        driver.enable_interrupt()?;
        Ok(driver)
    }

    /// Drains the ISR flags. Returns whether the push button fired.
    fn poll(&mut self) -> anyhow::Result<bool> {
        if BUTTON_RIGHT.swap(false, Ordering::Relaxed) {
            debug!("Right");
            self.right.enable_interrupt()?;
        }
        if BUTTON_DOWN.swap(false, Ordering::Relaxed) {
            debug!("Down");
            self.down.enable_interrupt()?;
        }
        if BUTTON_UP.swap(false, Ordering::Relaxed) {
            debug!("Up");
            self.up.enable_interrupt()?;
        }

        let mut pushed = false;
        if BUTTON_PUSH.swap(false, Ordering::Relaxed) {
            debug!("Push");
            self.push.enable_interrupt()?;
            pushed = true;
        }
        Ok(pushed)
    }
}

struct BrokerSession {
    client: EspMqttClient<'static>,
    connected: Arc<AtomicBool>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = NodeConfig::default();
    apply_build_time_credentials(&mut config);

    let topics = NodeTopics::new(&config.base, &config.area);

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem,
        pins,
        i2c0,
        adc1,
        ..
    } = Peripherals::take()?;

    let i2c = I2cDriver::new(
        i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(Hertz(100_000)),
    )?;
    let mut screen = StatusScreen::new(i2c).context("failed to initialize display")?;
    screen.show_lines(&["Starting..."])?;

    let mut probe =
        TempProbe::new(pins.gpio4.downgrade()).context("failed to initialize sensor probe")?;

    let mut status_led = PinDriver::output(pins.gpio2.downgrade_output())?;

    let mut buttons = Buttons::new(
        pins.gpio0.downgrade(),
        pins.gpio12.downgrade(),
        pins.gpio13.downgrade(),
        pins.gpio14.downgrade(),
    )
    .context("failed to initialize buttons")?;

    let adc = AdcDriver::new(adc1)?;
    let adc_config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let mut supply_channel = AdcChannelDriver::new(&adc, pins.gpio34, &adc_config)?;

    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?,
        sys_loop,
    )?;
    configure_station(&mut wifi, &config.wifi)?;

    if try_connect_wifi(&mut wifi, &config.wifi) {
        screen.show_lines(&["Starting...", "WiFi connected"])?;
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let mut supervisor = LinkSupervisor::new(config.connectivity.clone(), config.blink.clone());
    let mut blinker = StatusBlinker::new(supervisor.blink_pattern(), monotonic_ms());
    if blinker.led_on() {
        status_led.set_high()?;
    }

    let mut broker: Option<BrokerSession> = None;
    let mut reading = SensorReading::default();
    let mut display_on = true;
    let mut was_broker_up = false;

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        if buttons.poll()? {
            display_on = !display_on;
            if display_on {
                supervisor.force_display_refresh();
                screen.set_power(true)?;
            } else {
                screen.set_power(false)?;
            }
        }

        let wifi_up = wifi.is_up().unwrap_or(false);
        let broker_up = broker
            .as_ref()
            .map(|session| session.connected.load(Ordering::Relaxed))
            .unwrap_or(false);

        // Subscribe once per completed handshake.
        if broker_up && !was_broker_up {
            if let Some(session) = broker.as_mut() {
                match session
                    .client
                    .subscribe(topics.subscription.as_str(), QoS::AtMostOnce)
                {
                    Ok(_) => info!("subscribed to {}", topics.subscription),
                    Err(err) => warn!("subscribe failed: {err:?}"),
                }
            }
        }
        was_broker_up = broker_up;

        let actions = supervisor.tick(
            LinkHealth {
                wifi_up,
                broker_up,
            },
            now_ms,
        );

        blinker.set_pattern(supervisor.blink_pattern());
        if let Some(level) = blinker.tick(now_ms) {
            if level {
                status_led.set_high()?;
            } else {
                status_led.set_low()?;
            }
        }

        for action in actions {
            match action {
                LinkAction::ConnectWifi => {
                    try_connect_wifi(&mut wifi, &config.wifi);
                }
                LinkAction::ConnectBroker => {
                    info!(
                        "broker reconnect attempt {} of {}",
                        supervisor.retry_count(),
                        config.connectivity.max_retries_before_reboot,
                    );
                    // Replacing the session drops the old client; its poll
                    // thread exits with the closed connection.
                    was_broker_up = false;
                    match open_broker_session(&config.broker, &config.area) {
                        Ok(session) => broker = Some(session),
                        Err(err) => warn!("broker session setup failed: {err:#}"),
                    }
                }
                LinkAction::PublishReadings => {
                    reading.temperature_c = probe.read_temperature_c().unwrap_or(0.0);
                    publish_readings(broker.as_mut(), &topics, &reading);
                }
                LinkAction::RefreshDisplay => {
                    if display_on {
                        // Supply voltage is sampled at screen refresh time;
                        // publishes carry the last sample.
                        reading.supply_volts = match adc.read(&mut supply_channel) {
                            Ok(millivolts) => f32::from(millivolts) / 1000.0,
                            Err(err) => {
                                warn!("supply voltage read failed: {err:?}");
                                0.0
                            }
                        };
                        if let Err(err) = screen.render(supervisor.state(), &reading) {
                            warn!("display refresh failed: {err:#}");
                        }
                    }
                }
                LinkAction::Restart => {
                    warn!(
                        "retry ceiling exceeded after {} attempts; restarting",
                        supervisor.retry_count()
                    );
                    thread::sleep(Duration::from_millis(100));
                    esp_idf_svc::hal::reset::restart();
                }
            }
        }

        thread::sleep(Duration::from_millis(LOOP_PERIOD_MS));
    }
}

fn apply_build_time_credentials(config: &mut NodeConfig) {
    if config.wifi.ssid.is_empty() {
        config.wifi.ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }
    if config.wifi.password.is_empty() {
        config.wifi.password = option_env!("WIFI_PASS").unwrap_or("CHANGE_ME").to_string();
    }
    if config.broker.username.is_empty() {
        if let Some(user) = option_env!("MQTT_USER") {
            config.broker.username = user.to_string();
        }
    }
    if config.broker.password.is_empty() {
        if let Some(pass) = option_env!("MQTT_PASS") {
            config.broker.password = pass.to_string();
        }
    }
}

fn configure_station(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    config: &WifiConfig,
) -> anyhow::Result<()> {
    let auth_method = if config.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: config
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        channel: Some(config.channel),
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", config.ssid);
    Ok(())
}

/// Bounded association loop. Exhausting the attempts returns `false`
/// rather than an error; the supervisor decides what happens next.
fn try_connect_wifi(wifi: &mut BlockingWifi<EspWifi<'static>>, config: &WifiConfig) -> bool {
    for attempt in 1..=config.max_connect_attempts {
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected on attempt {attempt}");
                    return true;
                }
                Err(err) => warn!("wifi netif up failed on attempt {attempt}: {err:#}"),
            },
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }

        if attempt < config.max_connect_attempts {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(config.attempt_delay_ms));
        }
    }

    warn!(
        "all {} wifi connect attempts failed",
        config.max_connect_attempts
    );
    false
}

fn open_broker_session(config: &BrokerConfig, client_id: &str) -> anyhow::Result<BrokerSession> {
    let url = format!("mqtt://{}:{}", config.host, config.port);

    let conf = MqttClientConfiguration {
        client_id: Some(client_id),
        username: (!config.username.is_empty()).then_some(config.username.as_str()),
        password: (!config.password.is_empty()).then_some(config.password.as_str()),
        ..Default::default()
    };

    let (client, mut conn) = EspMqttClient::new(&url, &conf)?;
    let connected = Arc::new(AtomicBool::new(false));

    let conn_flag = connected.clone();
    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(8192)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                match event.payload() {
                    EventPayload::Connected(_) => conn_flag.store(true, Ordering::Relaxed),
                    EventPayload::Disconnected => conn_flag.store(false, Ordering::Relaxed),
                    EventPayload::Received { topic, data, .. } => {
                        // No message handling beyond logging.
                        info!(
                            "message on {}: {}",
                            topic.unwrap_or(""),
                            String::from_utf8_lossy(data)
                        );
                    }
                    _ => {}
                }
            }
            // Connection closed: session replaced or broker gone.
            conn_flag.store(false, Ordering::Relaxed);
        })
        .map_err(|err| anyhow!("failed to spawn mqtt thread: {err}"))?;

    Ok(BrokerSession { client, connected })
}

fn publish_readings(
    session: Option<&mut BrokerSession>,
    topics: &NodeTopics,
    reading: &SensorReading,
) {
    let Some(session) = session else {
        return;
    };

    let payload = match SensorPayload::from_reading(reading).to_json() {
        Ok(payload) => payload,
        Err(err) => {
            warn!("payload serialization failed: {err}");
            return;
        }
    };

    info!("publishing {payload}");
    // Fire and forget; a failed publish waits for the next interval.
    if let Err(err) = session
        .client
        .publish(topics.sensors.as_str(), QoS::AtMostOnce, true, payload.as_bytes())
    {
        warn!("publish failed: {err:?}");
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
