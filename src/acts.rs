//! The presentation catalog: one handler per [`Act`].

use crate::device::{DeviceApi, Pose};
use crate::models::Act;
use crate::presentation::Presentation;
use crate::remote;
use crate::sequencer::{ActError, ActRunner};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

const CLOSING_REMARK: &str = "Vielen Dank für eure Aufmerksamkeit!";
const FINALIZE_SECTION: &str = "finalize";

const SPEAKER_URI: &str = "Multimedia/speakers/SONOS_SPEAKER_URI";
const SPEAKER_MUTE: &str = "Multimedia/speakers/SONOS_SPEAKER_MUTE";
const SPEAKER_VOLUME: &str = "Multimedia/speakers/SONOS_SPEAKER_VOLUME";
const PROJECTOR: &str = "Conference/projector/PROJECTOR";
const ROLLER_SHUTTER: &str = "Conference/roller_shutters/ROLLER_SHUTTER_2";
const LIGHTS_GROUP: &str = "Kitchen/lights/HUE_Switch";
const LIGHTS_INDIVIDUAL: [&str; 4] = [
    "Kitchen/lights/HUE_1_Switch",
    "Kitchen/lights/HUE_2_Switch",
    "Kitchen/lights/HUE_3_Switch",
    "Kitchen/lights/HUE_4_Switch",
];

/// Listening and nodding while the assistant "answers", with the pause after each.
const ALEXA_ANIMATIONS: [(&str, f64); 5] = [
    ("animations/Stand/BodyTalk/Listening/Listening_1", 2.0),
    ("animations/Stand/Gestures/Yes_1", 2.0),
    ("animations/Stand/BodyTalk/Listening/Listening_7", 3.0),
    ("animations/Stand/Gestures/Yes_2", 2.0),
    ("animations/Stand/BodyTalk/Listening/Listening_4", 1.0),
];
const DRIVE_CAR_ANIMATION: &str = "animations/Stand/Waiting/DriveCar_1";

const QUARTER_TURN: f32 = 0.785;

/// Kitchen walk: turn, cross the room, face the counter, step closer.
const KITCHEN_ROUTE: [Pose; 4] = [
    Pose::turn(QUARTER_TURN),
    Pose::walk(3.3, 0.0, 0.0),
    Pose::turn(-1.5709),
    Pose::walk(0.5, 0.0, 0.0),
];

async fn pause(secs: f64) {
    sleep(Duration::from_secs_f64(secs)).await;
}

impl<D: DeviceApi + 'static> Presentation<D> {
    fn line(&self, section: &'static str, line: usize) -> Result<&str, ActError> {
        self.settings
            .text
            .line(section, line)
            .ok_or(ActError::MissingText { section, line })
    }

    /// Resolves every line before speaking, so a missing one silences the whole batch.
    fn say_lines<I>(&self, section: &'static str, lines: I) -> Result<(), ActError>
    where
        I: IntoIterator<Item = usize>,
    {
        let lines = lines
            .into_iter()
            .map(|n| self.line(section, n))
            .collect::<Result<Vec<_>, _>>()?;
        for line in lines {
            self.device.say(line)?;
        }
        Ok(())
    }

    /// Publishes to a configured item. Broker trouble is logged, not fatal.
    async fn publish(&self, path: &'static str, payload: &str) -> Result<(), ActError> {
        let item = self
            .settings
            .topics
            .resolve(path)
            .ok_or(ActError::MissingTopic(path))?;
        if let Err(e) = self.bridge.publish(item, payload).await {
            warn!("Publishing {} to {} failed, continuing: {}", payload, item, e);
        }
        Ok(())
    }

    async fn switch_lights(&self, payload: &str) -> Result<(), ActError> {
        if self.settings.app.config.lamps_individually {
            for lamp in LIGHTS_INDIVIDUAL {
                self.publish(lamp, payload).await?;
            }
            Ok(())
        } else {
            self.publish(LIGHTS_GROUP, payload).await
        }
    }

    async fn welcome(&self) -> Result<(), ActError> {
        self.say_lines("welcome", 1..=5)?;
        self.put_head_up();
        Ok(())
    }

    async fn music(&self) -> Result<(), ActError> {
        self.say_lines("music", 1..=2)?;

        self.publish(SPEAKER_URI, &self.settings.music_url).await?;
        self.publish(SPEAKER_MUTE, "OFF").await?;
        self.publish(SPEAKER_VOLUME, "50").await?;
        pause(5.0).await;

        self.device.run_behavior("Headbang")?;
        pause(2.0).await;

        self.publish(SPEAKER_MUTE, "ON").await?;
        pause(2.0).await;

        self.say_lines("music", [3])?;
        self.put_head_up();
        Ok(())
    }

    async fn alexa(&self) -> Result<(), ActError> {
        self.say_lines("alexa", [1])?;
        pause(1.0).await;
        self.say_lines("alexa", [2])?;
        pause(2.0).await;
        self.say_lines("alexa", [3])?;
        pause(0.5).await;
        self.say_lines("alexa", [4])?;

        for (animation, wait) in ALEXA_ANIMATIONS {
            self.device.run_animation(animation)?;
            pause(wait).await;
        }

        self.say_lines("alexa", [5])?;
        self.put_head_up();
        self.say_lines("alexa", 6..=7)?;

        if self.settings.app.config.projector_automatically {
            self.publish(PROJECTOR, "ON").await?;
        }
        pause(1.0).await;

        self.say_lines("alexa", [8])?;
        self.put_head_up();
        Ok(())
    }

    async fn roller_shutter(&self) -> Result<(), ActError> {
        self.say_lines("roller_shutter", [1])?;
        self.device.move_to(Pose::turn(-QUARTER_TURN))?;

        self.device.run_behavior("WTF")?;
        self.say_lines("roller_shutter", [2])?;

        self.publish(ROLLER_SHUTTER, "DOWN").await?;
        pause(12.0).await;
        self.publish(ROLLER_SHUTTER, "STOP").await?;

        self.device.move_to(Pose::turn(QUARTER_TURN))?;
        self.say_lines("roller_shutter", 3..=5)?;
        Ok(())
    }

    async fn car_driving_training(&self) -> Result<(), ActError> {
        self.say_lines("car_driving_training", [1])?;

        match &self.settings.ssh {
            Some(ssh) => remote::launch_detached(ssh.clone()),
            None => warn!("SSH_HOST is not configured, skipping the driving video."),
        }
        // The video worker is never awaited.
        pause(1.0).await;

        self.device.run_animation(DRIVE_CAR_ANIMATION)?;
        self.device.run_animation(DRIVE_CAR_ANIMATION)?;

        self.say_lines("car_driving_training", [2])?;
        self.publish(PROJECTOR, "OFF").await?;
        self.say_lines("car_driving_training", [3])?;
        Ok(())
    }

    async fn kitchen(&self) -> Result<(), ActError> {
        self.put_head_up();
        self.say_lines("kitchen", 1..=2)?;

        self.publish(ROLLER_SHUTTER, "UP").await?;

        for leg in KITCHEN_ROUTE {
            self.device.move_to(leg)?;
            pause(0.5).await;
        }
        self.put_head_up();

        self.say_lines("kitchen", 3..=4)?;
        self.switch_lights("ON").await?;
        pause(2.0).await;

        self.say_lines("kitchen", 5..=7)?;
        Ok(())
    }

    async fn farewell(&self) -> Result<(), ActError> {
        pause(2.0).await;
        self.say_lines("farewell", [1])?;
        self.device.move_to(Pose::walk(-1.0, 0.0, 0.0))?;

        self.switch_lights("OFF").await?;

        self.device.rest()?;
        Ok(())
    }
}

impl<D: DeviceApi + 'static> ActRunner for Presentation<D> {
    async fn run_act(&mut self, act: Act) -> Result<(), ActError> {
        info!("{}", act);
        match act {
            Act::Welcome => self.welcome().await,
            Act::Music => self.music().await,
            Act::Alexa => self.alexa().await,
            Act::RollerShutter => self.roller_shutter().await,
            Act::CarDrivingTraining => self.car_driving_training().await,
            Act::Kitchen => self.kitchen().await,
            Act::Farewell => self.farewell().await,
        }
    }

    async fn finalize(&mut self) -> Result<(), ActError> {
        info!("All acts done, closing the presentation.");
        let remark = self
            .settings
            .text
            .line(FINALIZE_SECTION, 1)
            .unwrap_or(CLOSING_REMARK);
        self.device.say(remark)?;
        self.put_head_up();
        Ok(())
    }
}
