#[derive(Debug, Clone)]
pub struct NodeTopics {
    pub sensors: String,
    pub subscription: String,
}

impl NodeTopics {
    pub fn new(base: &str, area: &str) -> Self {
        Self {
            sensors: format!("{base}/{area}/sensors"),
            subscription: format!("{base}/{area}/#"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builds_area_topics() {
        let topics = NodeTopics::new("home/test", "freezer");

        assert_eq!(topics.sensors, "home/test/freezer/sensors");
        assert_eq!(topics.subscription, "home/test/freezer/#");
    }
}
