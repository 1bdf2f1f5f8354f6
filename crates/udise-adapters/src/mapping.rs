//! Column mapping tables: UDISE+ API field names to stable output names.

use serde_json::Value as JsonValue;
use udise_core::{Fragment, Scalar};

/// Data category a mapping table applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingCategory {
    Search,
    Profile,
    Facility,
    ReportCard,
    Enrollment,
}

impl MappingCategory {
    pub const ALL: [MappingCategory; 5] = [
        MappingCategory::Search,
        MappingCategory::Profile,
        MappingCategory::Facility,
        MappingCategory::ReportCard,
        MappingCategory::Enrollment,
    ];

    pub fn table(self) -> &'static ColumnMapping {
        match self {
            MappingCategory::Search => &SEARCH_SCHOOLS,
            MappingCategory::Profile => &PROFILE,
            MappingCategory::Facility => &FACILITY,
            MappingCategory::ReportCard => &REPORT_CARD,
            MappingCategory::Enrollment => &ENROLLMENT,
        }
    }
}

/// Fixed rename table for one category: `(source_field, output_field)`.
#[derive(Debug)]
pub struct ColumnMapping {
    pub name: &'static str,
    pub fields: &'static [(&'static str, &'static str)],
}

impl ColumnMapping {
    pub fn output_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|(_, out)| *out)
    }

    /// Copies every mapped, non-null source field under its output name.
    ///
    /// Missing and null fields are omitted rather than written as null so a
    /// later merge never clobbers an earlier value with absence. Nested
    /// objects/arrays are skipped. Non-object input yields an empty fragment.
    pub fn transform(&self, source: &JsonValue) -> Fragment {
        let mut out = Fragment::new();
        let Some(object) = source.as_object() else {
            return out;
        };
        for (source_key, output_key) in self.fields {
            let Some(value) = object.get(*source_key) else {
                continue;
            };
            match Scalar::from_json(value) {
                Some(Scalar::Null) | None => {}
                Some(scalar) => {
                    out.insert((*output_key).to_string(), scalar);
                }
            }
        }
        out
    }
}

pub fn transform(source: &JsonValue, mapping: &ColumnMapping) -> Fragment {
    mapping.transform(source)
}

/// Output key of the enrollment row label, never written to a record.
pub const ENROLLMENT_NAME_KEY: &str = "enrollment_name";

pub static SEARCH_SCHOOLS: ColumnMapping = ColumnMapping {
    name: "search-schools",
    fields: &[
        ("schoolId", "school_id"),
        ("schoolName", "school_name"),
        ("yearDesc", "ay"),
        ("stateName", "state_name"),
        ("districtName", "district_name"),
        ("blockName", "block_name"),
        ("clusterName", "cluster_name"),
        ("villageName", "village_name"),
        ("pincode", "pincode"),
        ("schoolStatusName", "school_status"),
        ("schCategoryDesc", "school_category"),
        ("schMgmtDesc", "school_management"),
        ("schTypeDesc", "school_type"),
        ("schLocDesc", "location_type"),
    ],
};

pub static PROFILE: ColumnMapping = ColumnMapping {
    name: "profile",
    fields: &[
        ("estdYear", "established_year"),
        ("lowClass", "lowest_class"),
        ("highClass", "highest_class"),
        ("schMediumDesc1", "medium_of_instruction_1"),
        ("schMediumDesc2", "medium_of_instruction_2"),
        ("schMediumDesc3", "medium_of_instruction_3"),
        ("schAffBoardSecDesc", "board_secondary"),
        ("schAffBoardHSecDesc", "board_higher_secondary"),
        ("headMasterName", "head_master_name"),
        ("residentialSchDesc", "residential_school"),
        ("isMinoritySch", "minority_school"),
        ("isCwsnSch", "cwsn_school"),
        ("preprimaryYn", "pre_primary_section"),
        ("anganwadiYn", "anganwadi_centre"),
        ("email", "email"),
        ("website", "website"),
        ("latitude", "latitude"),
        ("longitude", "longitude"),
    ],
};

pub static FACILITY: ColumnMapping = ColumnMapping {
    name: "facility",
    fields: &[
        ("bldStatusDesc", "building_status"),
        ("totClassRooms", "total_classrooms"),
        ("clsrmsGood", "classrooms_good_condition"),
        ("toiletB", "toilets_boys"),
        ("toiletG", "toilets_girls"),
        ("drinkWaterYn", "drinking_water"),
        ("handwashYn", "handwash_facility"),
        ("electricityYn", "electricity"),
        ("libraryYn", "library"),
        ("playgroundYn", "playground"),
        ("rampsYn", "ramps"),
        ("medCheckYn", "medical_checkup"),
        ("compLabYn", "computer_lab"),
        ("totalComputers", "computers_functional"),
        ("internetYn", "internet"),
        ("solarPanelYn", "solar_panel"),
        ("boundaryWallDesc", "boundary_wall"),
        ("kitchenGardenYn", "kitchen_garden"),
    ],
};

pub static REPORT_CARD: ColumnMapping = ColumnMapping {
    name: "report-card",
    fields: &[
        ("totalTeacher", "total_teachers"),
        ("totalTeacherMale", "teachers_male"),
        ("totalTeacherFemale", "teachers_female"),
        ("tchRegular", "teachers_regular"),
        ("tchContract", "teachers_contract"),
        ("tchPartTime", "teachers_part_time"),
        ("ptr", "pupil_teacher_ratio"),
        ("scr", "student_classroom_ratio"),
        ("mdmStatusDesc", "mid_day_meal"),
        ("totalSections", "total_sections"),
    ],
};

pub static ENROLLMENT: ColumnMapping = ColumnMapping {
    name: "enrollment",
    fields: &[
        ("enrollmentName", ENROLLMENT_NAME_KEY),
        ("ppB", "class_pp_boy"),
        ("ppG", "class_pp_girl"),
        ("c1B", "class_1_boy"),
        ("c1G", "class_1_girl"),
        ("c2B", "class_2_boy"),
        ("c2G", "class_2_girl"),
        ("c3B", "class_3_boy"),
        ("c3G", "class_3_girl"),
        ("c4B", "class_4_boy"),
        ("c4G", "class_4_girl"),
        ("c5B", "class_5_boy"),
        ("c5G", "class_5_girl"),
        ("c6B", "class_6_boy"),
        ("c6G", "class_6_girl"),
        ("c7B", "class_7_boy"),
        ("c7G", "class_7_girl"),
        ("c8B", "class_8_boy"),
        ("c8G", "class_8_girl"),
        ("c9B", "class_9_boy"),
        ("c9G", "class_9_girl"),
        ("c10B", "class_10_boy"),
        ("c10G", "class_10_girl"),
        ("c11B", "class_11_boy"),
        ("c11G", "class_11_girl"),
        ("c12B", "class_12_boy"),
        ("c12G", "class_12_girl"),
        ("totB", "total_boy"),
        ("totG", "total_girl"),
        ("total", "total"),
    ],
};

/// Statistics endpoint fields written under fixed names, bypassing the mapper.
pub const STATISTICS_FIELDS: [(&str, &str); 3] = [
    ("totalBoy", "totalBoyStudents"),
    ("totalGirl", "totalGirlStudents"),
    ("totalCount", "totalStudents"),
];
