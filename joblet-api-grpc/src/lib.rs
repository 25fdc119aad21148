// Copyright 2024-2025 Joblet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/mod.rs"));

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/services.bin"));

    impl From<uuid::Uuid> for joblet::common::Uuid {
        fn from(value: uuid::Uuid) -> Self {
            Self {
                value: value.to_string(),
            }
        }
    }

    impl TryFrom<joblet::common::Uuid> for uuid::Uuid {
        type Error = String;

        fn try_from(value: joblet::common::Uuid) -> Result<Self, Self::Error> {
            uuid::Uuid::parse_str(&value.value).map_err(|err| format!("Invalid UUID: {err}"))
        }
    }
}

#[cfg(test)]
test_r::enable!();

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::proto::joblet::common;
    use uuid::Uuid;

    #[test]
    fn uuid_proto_roundtrip() {
        let id = Uuid::new_v4();
        let proto: common::Uuid = id.into();
        let back: Uuid = proto.try_into().unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn invalid_uuid_is_rejected() {
        let proto = common::Uuid {
            value: "not-a-uuid".to_string(),
        };
        let result: Result<Uuid, String> = proto.try_into();
        assert!(result.is_err());
    }
}
