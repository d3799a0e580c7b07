//! Schema elements of pipeline channels declared by device classes.

use karabo_core::{CoreResult, Element, NodeRole, Schema};

use crate::pipeline::{DEFAULT_MAX_QUEUE_LENGTH, MAX_QUEUE_LENGTH};

const POLICIES: [&str; 4] = ["drop", "queue", "queueDrop", "wait"];

/// Declare output channel `key` writing hashes described by `data`.
pub fn add_output_channel(schema: &mut Schema, key: &str, data: &Schema) -> CoreResult<()> {
    schema.add(
        Element::channel_node(key, NodeRole::OutputChannel)
            .displayed_name(key)
            .description("Pipeline output channel"),
    )?;
    schema.add(
        Element::string(format!("{key}.hostname"))
            .displayed_name("Hostname")
            .description("Address to listen on; 'default' picks the loopback interface")
            .init_only()
            .default_value("default"),
    )?;
    schema.add(
        Element::uint32(format!("{key}.port"))
            .displayed_name("Port")
            .description("Port to listen on; 0 picks a free one")
            .init_only()
            .default_value(0u32)
            .max_inc(65535u32),
    )?;
    schema.add(
        Element::string(format!("{key}.noInputShared"))
            .displayed_name("No Input (Shared)")
            .description("What to do when the next shared input is busy")
            .init_only()
            .options(POLICIES)
            .default_value("drop"),
    )?;
    schema.add(
        Element::uint32(format!("{key}.maxQueueLength"))
            .displayed_name("Max. Queue Length")
            .description("Upper bound of the chunks buffered for one input")
            .init_only()
            .default_value(DEFAULT_MAX_QUEUE_LENGTH)
            .min_inc(1u32)
            .max_inc(MAX_QUEUE_LENGTH),
    )?;
    add_output_schema(schema, key, data)
}

/// (Re)place the data description of output `key`.
pub(crate) fn add_output_schema(schema: &mut Schema, key: &str, data: &Schema) -> CoreResult<()> {
    let node = data
        .elements()
        .iter()
        .fold(Element::channel_node(format!("{key}.schema"), NodeRole::OutputSchema), |node, e| {
            node.child(e.clone())
        });
    schema.add(node.displayed_name("Data Schema"))?;
    Ok(())
}

/// Declare input channel `key`.
pub fn add_input_channel(schema: &mut Schema, key: &str) -> CoreResult<()> {
    schema.add(
        Element::channel_node(key, NodeRole::InputChannel)
            .displayed_name(key)
            .description("Pipeline input channel"),
    )?;
    schema.add(
        Element::vector_string(format!("{key}.connectedOutputChannels"))
            .displayed_name("Connected Output Channels")
            .description("Outputs to read from, as deviceId:channelName")
            .reconfigurable()
            .default_value(Vec::<String>::new()),
    )?;
    schema.add(
        Element::string(format!("{key}.dataDistribution"))
            .displayed_name("Data Distribution")
            .description("'copy': every chunk; 'shared': take turns with other shared inputs")
            .init_only()
            .options(["copy", "shared"])
            .default_value("copy"),
    )?;
    schema.add(
        Element::string(format!("{key}.onSlowness"))
            .displayed_name("On Slowness")
            .description("What the output does while this input is busy")
            .init_only()
            .options(POLICIES)
            .default_value("drop"),
    )?;
    schema.add(
        Element::uint32(format!("{key}.maxQueueLength"))
            .displayed_name("Max. Queue Length")
            .description("Chunks the output may buffer for this input")
            .init_only()
            .default_value(DEFAULT_MAX_QUEUE_LENGTH)
            .min_inc(1u32)
            .max_inc(MAX_QUEUE_LENGTH),
    )?;
    schema.add(
        Element::uint32(format!("{key}.delayOnInput"))
            .displayed_name("Delay on Input")
            .description("Milliseconds to wait before asking for the next chunk")
            .reconfigurable()
            .default_value(0u32),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use karabo_core::{Hash, ValidationRules, Validator};

    #[test]
    fn channel_defaults_validate() {
        let mut data = Schema::new("Data");
        data.add(Element::int32("counter").read_only()).unwrap();
        let mut schema = Schema::new("Dev");
        add_output_channel(&mut schema, "output", &data).unwrap();
        add_input_channel(&mut schema, "input").unwrap();

        assert_eq!(schema.channels(NodeRole::OutputChannel), vec!["output"]);
        assert_eq!(schema.channels(NodeRole::InputChannel), vec!["input"]);
        assert!(schema.has("output.schema.counter"));

        let outcome = Validator::new(ValidationRules::default()).validate(&schema, &Hash::new(), None);
        assert!(outcome.ok, "{}", outcome.message);
        assert_eq!(outcome.validated.get::<String>("input.onSlowness").unwrap(), "drop");
        assert_eq!(outcome.validated.get::<u32>("output.port").unwrap(), 0);
    }

    #[test]
    fn output_schema_is_not_configurable() {
        let mut data = Schema::new("Data");
        data.add(Element::int32("counter").read_only()).unwrap();
        let mut schema = Schema::new("Dev");
        add_output_channel(&mut schema, "output", &data).unwrap();
        let mut config = Hash::new();
        config.set("output.schema.counter", 3i32);
        let outcome = Validator::new(ValidationRules::default()).validate(&schema, &config, None);
        assert!(!outcome.ok);
    }
}
