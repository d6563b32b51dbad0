pub mod ha_interface;
pub mod store;

use std::collections::HashMap;
use std::io::Error;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{self, Value};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::RwLock;

use crate::config::ConfigBases;
use crate::get_config_or_panic;
use crate::get_unix_ts;
use crate::mqtt::ha_interface::HaDiscover;

pub const TOPIC_BASE: &str = "sdm2mqtt";

#[derive(Clone)]
pub struct AppStatus {
    pub start_time: Instant,
}

impl AppStatus {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for AppStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// One meter's worth of capability values as published to the state topic.
#[derive(Serialize, Deserialize)]
pub struct MeterReading {
    pub meter_name: String,
    pub model: String,
    pub metered_time: u64,
    pub values: serde_json::Map<String, Value>,
}

pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

pub struct SubscribeData {
    pub topic: String,
    pub sender: tokio::sync::mpsc::Sender<String>,
}

pub enum Transmission {
    Metering(MeterReading),
    AutoDiscovery(HaDiscover),
    Subscribe(SubscribeData),
    Publish(PublishData),
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
}

pub struct Callbacks {
    calls: HashMap<String, Vec<tokio::sync::mpsc::Sender<String>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        return Callbacks { calls: HashMap::new() };
    }

    pub fn insert(&mut self, topic: String, callback: tokio::sync::mpsc::Sender<String>) {
        if !self.calls.contains_key(&topic) {
            debug!("Adding new vector to topic {topic}");
            self.calls.insert(topic, vec![callback]);
        } else {
            debug!("Adding a new element to known vector at topic {topic}");
            let v = self.calls.get_mut(&topic).unwrap();
            v.push(callback);
        }
    }

    pub async fn send(&self, topic: String, payload: String) {
        if !self.calls.contains_key(&topic) {
            debug!("Send for unknown topic {topic}");
            return;
        }

        let v = self.calls.get(&topic).unwrap();
        for call in v {
            debug!("Sending to callback: {payload}");
            let _ = call.send(payload.clone()).await;
        }
    }

    pub async fn get_topics(&self) -> Vec<String> {
        let mut d: Vec<String> = Vec::new();
        for key in self.calls.keys() {
            d.push(key.clone());
        }
        return d;
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref CALLBACKS: RwLock<Callbacks> = RwLock::new(Callbacks::new());
    pub static ref APP_STATUS: RwLock<AppStatus> = RwLock::new(AppStatus::new());
}

impl MqttManager {
    pub fn new() -> Result<(Self, Sender<Transmission>), Error> {
        let (mtx, mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection starting up");
        let config = get_config_or_panic!("mqtt", ConfigBases::Mqtt);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_credentials(config.user.clone(), config.pass.clone());

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Spawn a new thread to handle the incomming commands
        let reconnect_c = client.clone();
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let topic = p.topic;
                        let payload = match String::from_utf8(p.payload.to_vec()) {
                            Ok(payload) => payload,
                            Err(_) => {
                                debug!("Dropping non UTF-8 payload on {topic}");
                                continue;
                            }
                        };
                        debug!("Received MQTT command {payload:?}");

                        let callback = CALLBACKS.write().await;
                        callback.send(topic.clone(), payload.clone()).await;
                    },
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, resubscribing everything");

                        /* We are connected resubstribe to everything */
                        let callbacks = CALLBACKS.read().await.get_topics().await;
                        for callback in callbacks {
                            /* Move the resubscription to it's own thread */
                            let client_clone = reconnect_c.clone();
                            tokio::spawn(async move {
                                let _ = client_clone.subscribe(callback, QoS::AtLeastOnce).await;
                            });
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting ", e);
                    }
                }
            }
        });

        return Ok((MqttManager {
            client: client,
            rx: mrx,
            exit_thread: false,
        }, mtx));
    }

    pub async fn start_thread(&mut self) {
        // Handle all the incomming metering stuff
        while !self.exit_thread {
            let option = self.rx.recv().await;

            if option.is_none() {
                debug!("Reading returned none, we exit now");
                self.exit_thread = true;
                continue;
            }

            match option.unwrap() {
                Transmission::Metering(reading) => {
                    debug!("Meter reading received from {}", reading.meter_name);
                    match self.client.publish(
                        format!("{TOPIC_BASE}/raw"),
                        QoS::AtLeastOnce,
                        false,
                        serde_json::to_string(&reading).unwrap(),
                    ).await {
                        Err(e) => { error!("Error sending: {}", e); },
                        Ok(_) => { debug!("Send successfully"); }
                    }

                    let _ = self.client.publish(
                        format!("{TOPIC_BASE}/devs/modbus/{}", reading.meter_name),
                        QoS::AtLeastOnce,
                        false,
                        serde_json::to_string(&reading.values).unwrap(),
                    ).await;
                },
                Transmission::AutoDiscovery(disc) => {
                    let _ = self.client.publish(
                        disc.discover_topic.clone(),
                        QoS::AtLeastOnce,
                        true,
                        serde_json::to_string(&disc).unwrap(),
                    ).await;
                },
                Transmission::Subscribe(subscribe_data) => {
                    let topic = format!("{TOPIC_BASE}/{}", subscribe_data.topic);
                    if self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await.is_ok() {
                        CALLBACKS.write().await.insert(topic.clone(), subscribe_data.sender);
                        info!("Registered Callback {topic}");
                    }
                },
                Transmission::Publish(publish_data) => {
                    match self.client.publish(
                        publish_data.topic,
                        match publish_data.qos {
                            0 => QoS::AtMostOnce,
                            1 => QoS::AtLeastOnce,
                            2 => QoS::ExactlyOnce,
                            _ => QoS::AtMostOnce,
                        },
                        publish_data.retain,
                        publish_data.payload,
                    ).await {
                        Err(e) => { error!("Error publishing: {}", e); },
                        Ok(_) => { debug!("Published successfully"); }
                    }
                },
            };
        }

        info!("Thread exit, waiting");
    }
}

pub async fn get_app_status() -> AppStatus {
    APP_STATUS.read().await.clone()
}

pub async fn publish_uptime(mqtt_sender: &Sender<Transmission>) {
    let app_status = get_app_status().await;

    let uptime_publish = PublishData {
        topic: format!("{TOPIC_BASE}/mgt/uptime"),
        payload: app_status.uptime_seconds().to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(uptime_publish)).await;
}

pub async fn publish_protocol_count(mqtt_sender: &Sender<Transmission>, protocol: &str, count: u32) {
    let count_publish = PublishData {
        topic: format!("{TOPIC_BASE}/mgt/{}/count", protocol),
        payload: count.to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(count_publish)).await;
}

/// Build one meter reading document from the current capability values.
pub fn build_reading(meter_name: &str, model: &str, values: &HashMap<String, Value>) -> MeterReading {
    let mut map = serde_json::Map::new();
    for (key, value) in values {
        map.insert(key.clone(), value.clone());
    }
    MeterReading {
        meter_name: meter_name.to_string(),
        model: model.to_string(),
        metered_time: get_unix_ts(),
        values: map,
    }
}
