//! Persistence of composites: a serde dictionary of topology, variable identities,
//! parameter values and stateful-node RNG positions, with bincode and JSON encodings.

mod codec;
mod decode;
mod dictionary;
mod encode;
mod legacy;

pub use codec::{from_bytes, from_json, to_bytes, to_json};
pub use dictionary::{
    BlockCompositeRecord, GraphDictionary, NodeRecord, OutputRecord, TensorRecord,
    VariableRecord, CURRENT_VERSION, SUPPORTED_VERSIONS,
};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::composite::CompositeFunction;
    use crate::device::DeviceDescriptor;
    use crate::error::ErrorKind;
    use crate::graph::{fingerprint, GraphArena, Parameter, RngState, Variable};
    use crate::tensor::Tensor;

    fn cpu() -> DeviceDescriptor {
        DeviceDescriptor::cpu()
    }

    // out = dropout(sigmoid(x * w + c)) with the sigmoid(x * w) part wrapped in a block.
    fn model() -> (Arc<CompositeFunction>, Parameter) {
        let arena = GraphArena::new();
        let w = Parameter::new(Tensor::from_vec([3], vec![0.5, -1.0, 2.0]).unwrap(), "w");
        let p = Variable::placeholder([3], "p");
        let body = arena
            .sigmoid(&arena.element_times(&p, w.variable()).unwrap())
            .unwrap();
        let x = Variable::input([3], "x");
        let block = arena
            .as_block(body.owner().unwrap(), &[(p, x)], "Gate", "gate")
            .unwrap();
        let gated = arena.outputs(block).unwrap()[0].clone();
        let c = Variable::constant(Tensor::ones([3], cpu()), "c");
        let shifted = arena.plus(&gated, &c).unwrap();
        let out = arena.dropout(&shifted, 0.25, 11).unwrap();
        let f = CompositeFunction::create(&arena, out.owner().unwrap(), "model", "").unwrap();
        (f, w)
    }

    fn dropout_state(f: &CompositeFunction) -> Option<RngState> {
        f.arena().node(f.root()).unwrap().rng_state()
    }

    #[test]
    fn round_trip_preserves_identity_and_state() {
        let (f, w) = model();
        w.set_value(Tensor::from_vec([3], vec![1.0, 2.0, 3.0]).unwrap())
            .unwrap();
        let dictionary = f.serialize().unwrap();
        assert_eq!(dictionary.version, CURRENT_VERSION);
        assert_eq!(dictionary.nodes.len(), 3);

        let restored = CompositeFunction::deserialize(&dictionary, cpu()).unwrap();
        assert_eq!(restored.uid(), f.uid());
        assert_eq!(restored.name(), "model");
        assert_eq!(
            fingerprint(restored.arena(), restored.root()).unwrap(),
            fingerprint(f.arena(), f.root()).unwrap()
        );
        assert_eq!(restored.output().uid(), f.output().uid());

        let parameters = restored.parameters();
        assert_eq!(parameters.len(), 1);
        assert_eq!(parameters[0].uid(), w.uid());
        assert_eq!(parameters[0].value().data(), &[1.0, 2.0, 3.0]);
        assert_eq!(parameters[0].timestamp(), w.timestamp());
        assert_eq!(restored.constants()[0].constant_value().unwrap().data(), &[1.0; 3]);
        assert_eq!(dropout_state(&restored), dropout_state(&f));

        let names: Vec<String> = restored.arguments().iter().map(|v| v.name().to_string()).collect();
        assert_eq!(names, vec!["x".to_string()]);
    }

    #[test]
    fn block_bodies_survive_round_trip() {
        let (f, _) = model();
        let dictionary = f.serialize().unwrap();
        let block = dictionary
            .nodes
            .iter()
            .find_map(|node| node.block.as_ref())
            .unwrap();
        assert_eq!(block.op_name, "Gate");
        assert_eq!(block.nodes.len(), 2);
        assert_eq!(block.variables.len(), 1);

        let restored = CompositeFunction::deserialize(&dictionary, cpu()).unwrap();
        let again = restored.serialize().unwrap();
        assert_eq!(again, dictionary);
    }

    #[test]
    fn bytes_and_json_decode_to_same_dictionary() {
        let (f, _) = model();
        let dictionary = f.serialize().unwrap();
        let bytes = to_bytes(&dictionary).unwrap();
        assert_eq!(&bytes[..8], b"FNGRAPH1");
        assert_eq!(from_bytes(&bytes).unwrap(), dictionary);
        assert_eq!(from_json(&to_json(&dictionary).unwrap()).unwrap(), dictionary);
    }

    #[test]
    fn version_one_restarts_random_streams() {
        let (f, _) = model();
        f.arena()
            .lock()
            .set_rng_state(f.root(), RngState { seed: 11, offset: 5 })
            .unwrap();
        let legacy = legacy::downgrade(f.serialize().unwrap());

        let mut bytes = b"FNGRAPH1".to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&bincode::serialize(&legacy).unwrap());
        let dictionary = from_bytes(&bytes).unwrap();
        assert_eq!(dictionary.version, CURRENT_VERSION);
        assert!(dictionary.nodes.iter().all(|node| node.rng_state.is_none()));

        let restored = CompositeFunction::deserialize(&dictionary, cpu()).unwrap();
        assert_eq!(
            dropout_state(&restored),
            Some(RngState { seed: 11, offset: 0 })
        );

        let text = serde_json::to_string(&legacy).unwrap();
        assert_eq!(from_json(&text).unwrap(), dictionary);
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let (f, _) = model();
        let mut dictionary = f.serialize().unwrap();
        dictionary.version = 9;
        let err = CompositeFunction::deserialize(&dictionary, cpu()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);

        let err = from_bytes(&to_bytes(&dictionary).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
        let err = from_json(&to_json(&dictionary).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    }

    #[test]
    fn bad_header_is_a_serialization_error() {
        let err = from_bytes(b"NOTAGRAPH").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn node_order_is_recomputed() {
        let (f, _) = model();
        let mut dictionary = f.serialize().unwrap();
        dictionary.nodes.reverse();
        let restored = CompositeFunction::deserialize(&dictionary, cpu()).unwrap();
        assert_eq!(restored.primitive_function_count(), 3);
    }

    #[test]
    fn missing_producers_and_cycles_are_inconsistent() {
        let (f, _) = model();
        let dictionary = f.serialize().unwrap();

        let mut missing = dictionary.clone();
        missing.nodes.remove(0);
        let err = CompositeFunction::deserialize(&missing, cpu()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GraphInconsistency);

        let mut cyclic = dictionary;
        let last = cyclic.nodes.len() - 1;
        let tail_output = cyclic.nodes[last].outputs[0].uid.clone();
        cyclic.nodes[1].inputs[0] = tail_output;
        let err = CompositeFunction::deserialize(&cyclic, cpu()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GraphInconsistency);
    }

    #[test]
    fn parameters_are_placed_on_target_device() {
        let (f, _) = model();
        let gpu = DeviceDescriptor::gpu(1);
        let restored = f.clone_with_parameters(gpu).unwrap();
        assert_eq!(restored.parameters()[0].value().device(), gpu);
        assert_ne!(
            restored.parameters()[0].variable(),
            f.parameters()[0].variable()
        );
    }
}
